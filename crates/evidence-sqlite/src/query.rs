use crate::{Db, EvidenceRow};
use anyhow::Result;
use leaktrace_core::{ProfileId, TimeWindowId};
use rusqlite::{params, OptionalExtension};
use std::net::IpAddr;

impl Db {
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let cnt: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?",
            [name],
            |r| r.get(0),
        )?;
        Ok(cnt > 0)
    }

    pub fn profile_exists(&self, ip: IpAddr) -> Result<bool> {
        let cnt: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM profiles WHERE profile_id=?",
            [ProfileId::for_ip(ip).0],
            |r| r.get(0),
        )?;
        Ok(cnt > 0)
    }

    /// Window containing `ts` (start inclusive, end exclusive); earliest start wins.
    pub fn lookup_time_window(&self, profile: &ProfileId, ts: f64) -> Result<Option<TimeWindowId>> {
        let tw = self
            .conn
            .query_row(
                "SELECT tw_id FROM timewindows WHERE profile_id=? AND start_ts<=? AND ?<end_ts ORDER BY start_ts LIMIT 1",
                params![profile.0, ts, ts],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        Ok(tw.map(TimeWindowId))
    }

    pub fn lookup_port_info(&self, portproto: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT info FROM port_info WHERE portproto=?", [portproto], |r| r.get(0))
            .optional()?)
    }

    pub fn lookup_identification(&self, ip: IpAddr) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT annotation FROM ip_identification WHERE address=?", [ip.to_string()], |r| r.get(0))
            .optional()?)
    }

    pub fn list_evidence(&self) -> Result<Vec<EvidenceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT uid,evidence_type,rule_name,attacker,attacker_direction,profile_id,tw_id,port,proto,confidence,threat_level,category,source_target_tag,description,ts,ts_text
             FROM evidence ORDER BY ts, uid",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(EvidenceRow {
                uid: r.get(0)?,
                evidence_type: r.get(1)?,
                rule_name: r.get(2)?,
                attacker: r.get(3)?,
                attacker_direction: r.get(4)?,
                profile_id: r.get(5)?,
                tw_id: r.get(6)?,
                port: r.get(7)?,
                proto: r.get(8)?,
                confidence: r.get(9)?,
                threat_level: r.get(10)?,
                category: r.get(11)?,
                source_target_tag: r.get(12)?,
                description: r.get(13)?,
                ts: r.get(14)?,
                ts_text: r.get(15)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn error_count(&self, run_id: &uuid::Uuid) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(1) FROM errors WHERE run_id=?",
            [run_id.to_string()],
            |r| r.get(0),
        )?)
    }
}
