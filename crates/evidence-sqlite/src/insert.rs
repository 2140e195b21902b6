use crate::{Db, RunMeta, StoreSeed};
use anyhow::{anyhow, Context, Result};
use leaktrace_core::{EvidenceRecord, ProfileId};
use rusqlite::params;
use std::net::IpAddr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// RFC 3339 rendering of an epoch timestamp with fractional seconds.
pub fn format_epoch(ts: f64) -> String {
    let nanos = (ts * 1e9) as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| ts.to_string())
}

impl Db {
    pub fn begin_run(&self, meta: RunMeta) -> Result<Uuid> {
        self.conn.execute(
            "INSERT INTO runs(run_id, started_at, tool_version, capture_path, args_json) VALUES (?,?,?,?,?)",
            params![meta.run_id.to_string(), meta.started_at, meta.tool_version, meta.capture_path, meta.args_json],
        )?;
        Ok(meta.run_id)
    }

    pub fn finish_run(&self, run_id: &Uuid, finished_at: i64, evidence_count: i64, error_count: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE runs SET finished_at=?, evidence_count=?, error_count=? WHERE run_id=?",
            params![finished_at, evidence_count, error_count, run_id.to_string()],
        )?;
        Ok(())
    }

    pub fn add_error(&self, run_id: &Uuid, scope: &str, code: &str, message: &str, at_ms: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO errors(run_id,scope,code,message,at_ms) VALUES (?,?,?,?,?)",
            params![run_id.to_string(), scope, code, message, at_ms],
        )?;
        Ok(())
    }

    pub fn add_profile(&self, ip: IpAddr) -> Result<ProfileId> {
        let profile = ProfileId::for_ip(ip);
        self.conn.execute(
            "INSERT INTO profiles(profile_id,address,created_ms) VALUES (?,?,?) ON CONFLICT(profile_id) DO NOTHING",
            params![profile.0, ip.to_string(), now_ms()],
        )?;
        Ok(profile)
    }

    pub fn add_time_window(&self, profile: &ProfileId, tw_id: &str, start_ts: f64, end_ts: f64) -> Result<()> {
        if end_ts <= start_ts {
            return Err(anyhow!("time window {tw_id} ends before it starts"));
        }
        self.conn.execute(
            "INSERT INTO timewindows(profile_id,tw_id,start_ts,end_ts) VALUES (?,?,?,?)
             ON CONFLICT(profile_id,tw_id) DO UPDATE SET start_ts=excluded.start_ts, end_ts=excluded.end_ts",
            params![profile.0, tw_id, start_ts, end_ts],
        )?;
        Ok(())
    }

    pub fn set_port_info(&self, portproto: &str, info: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO port_info(portproto,info) VALUES (?,?) ON CONFLICT(portproto) DO UPDATE SET info=excluded.info",
            params![portproto, info],
        )?;
        Ok(())
    }

    pub fn set_ip_identification(&self, ip: IpAddr, annotation: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO ip_identification(address,annotation) VALUES (?,?) ON CONFLICT(address) DO UPDATE SET annotation=excluded.annotation",
            params![ip.to_string(), annotation],
        )?;
        Ok(())
    }

    /// Write-once: a second insert with the same `unique_id` fails.
    pub fn insert_evidence(&self, ev: &EvidenceRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO evidence(uid,evidence_type,rule_name,attacker,attacker_direction,profile_id,tw_id,port,proto,confidence,threat_level,category,source_target_tag,description,ts,ts_text)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
            params![
                ev.unique_id,
                ev.evidence_type,
                ev.rule_name,
                ev.attacker_ip.to_string(),
                ev.attacker_direction.as_str(),
                ev.victim_profile_id.0,
                ev.victim_time_window.0,
                ev.port as i64,
                ev.protocol.as_str(),
                ev.confidence as f64,
                ev.threat_level.as_str(),
                ev.category,
                ev.source_target_tag,
                ev.description,
                ev.timestamp,
                format_epoch(ev.timestamp),
            ],
        )?;
        Ok(())
    }

    /// Loads a seed document atomically. Returns the number of profiles touched.
    pub fn apply_seed(&self, seed: &StoreSeed) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for p in &seed.profiles {
            let ip: IpAddr = p.address.parse().with_context(|| format!("invalid profile address {}", p.address))?;
            let profile = self.add_profile(ip)?;
            for w in &p.windows {
                self.add_time_window(&profile, &w.id, w.start, w.end)?;
            }
        }
        for (portproto, info) in &seed.port_info {
            self.set_port_info(portproto, info)?;
        }
        for (addr, annotation) in &seed.identifications {
            let ip: IpAddr = addr.parse().with_context(|| format!("invalid address {addr}"))?;
            self.set_ip_identification(ip, annotation)?;
        }
        tx.commit()?;
        Ok(seed.profiles.len())
    }
}
