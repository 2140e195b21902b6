pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE runs (
  run_id          TEXT PRIMARY KEY,
  started_at      INTEGER NOT NULL,
  finished_at     INTEGER,
  tool_version    TEXT NOT NULL,
  capture_path    TEXT NOT NULL,
  args_json       TEXT NOT NULL,
  evidence_count  INTEGER DEFAULT 0,
  error_count     INTEGER DEFAULT 0
);

CREATE TABLE profiles (
  profile_id      TEXT PRIMARY KEY,
  address         TEXT NOT NULL UNIQUE,
  created_ms      INTEGER NOT NULL
);

CREATE TABLE timewindows (
  profile_id      TEXT NOT NULL REFERENCES profiles(profile_id) ON DELETE CASCADE,
  tw_id           TEXT NOT NULL,
  start_ts        REAL NOT NULL,
  end_ts          REAL NOT NULL CHECK (end_ts > start_ts),
  PRIMARY KEY (profile_id, tw_id)
);

CREATE TABLE port_info (
  portproto       TEXT PRIMARY KEY,
  info            TEXT NOT NULL
);

CREATE TABLE ip_identification (
  address         TEXT PRIMARY KEY,
  annotation      TEXT NOT NULL
);

CREATE TABLE evidence (
  uid             TEXT PRIMARY KEY,
  evidence_type   TEXT NOT NULL,
  rule_name       TEXT NOT NULL,
  attacker        TEXT NOT NULL,
  attacker_direction TEXT NOT NULL CHECK (attacker_direction IN ('source','destination')),
  profile_id      TEXT NOT NULL,
  tw_id           TEXT NOT NULL,
  port            INTEGER NOT NULL,
  proto           TEXT NOT NULL CHECK (proto IN ('tcp','udp')),
  confidence      REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  threat_level    TEXT NOT NULL,
  category        TEXT NOT NULL,
  source_target_tag TEXT,
  description     TEXT NOT NULL,
  ts              REAL NOT NULL,
  ts_text         TEXT NOT NULL
);

CREATE TABLE errors (
  error_id        INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id          TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
  scope           TEXT NOT NULL,
  code            TEXT NOT NULL,
  message         TEXT NOT NULL,
  at_ms           INTEGER NOT NULL
);

CREATE INDEX idx_tw_lookup ON timewindows(profile_id, start_ts);
CREATE INDEX idx_evidence_profile ON evidence(profile_id, tw_id);
CREATE INDEX idx_errors_run ON errors(run_id);

COMMIT;
"#
;
