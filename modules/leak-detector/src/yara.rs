//! Pattern scanning through `yara`/`yarac`.

use crate::tshark::probe_binary;
use leaktrace_core::{DetectError, MatchRecord};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

const COMPILED_SUFFIX: &str = "_compiled";

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("`{tool}` could not be started: {source}")]
    Unavailable { tool: String, source: io::Error },

    #[error("scan with {rule_set} failed: {stderr}")]
    Failed { rule_set: String, stderr: String },
}

/// Runs one compiled rule set over a capture.
pub trait Scanner {
    fn ensure_available(&self) -> Result<(), DetectError> {
        Ok(())
    }

    /// Hits in the order the scanner printed them. No output means no hits.
    fn scan(&self, rule_set: &Path, capture: &Path) -> Result<Vec<MatchRecord>, ScanError>;
}

impl<S: Scanner + ?Sized> Scanner for &S {
    fn ensure_available(&self) -> Result<(), DetectError> {
        (**self).ensure_available()
    }

    fn scan(&self, rule_set: &Path, capture: &Path) -> Result<Vec<MatchRecord>, ScanError> {
        (**self).scan(rule_set, capture)
    }
}

#[derive(Debug, Clone)]
pub struct YaraScanner {
    yara: PathBuf,
    yarac: PathBuf,
    threads: u32,
}

impl Default for YaraScanner {
    fn default() -> Self {
        YaraScanner::new("yara", "yarac", 7)
    }
}

impl YaraScanner {
    pub fn new(yara: impl Into<PathBuf>, yarac: impl Into<PathBuf>, threads: u32) -> Self {
        YaraScanner { yara: yara.into(), yarac: yarac.into(), threads: threads.max(1) }
    }

    /// Compiles every rule in `rules_dir` that has no `<name>_compiled` file in
    /// `compiled_dir` yet, then lists the compiled rule sets (sorted).
    /// A rule that fails to compile is skipped with a warning, and a missing
    /// `rules_dir` only means nothing new gets compiled.
    pub fn prepare_rule_sets(&self, rules_dir: &Path, compiled_dir: &Path) -> Result<Vec<PathBuf>, DetectError> {
        fs::create_dir_all(compiled_dir)?;
        let sources = if rules_dir.is_dir() {
            sorted_files(rules_dir)?
        } else {
            tracing::warn!(dir = %rules_dir.display(), "rules directory missing, using already compiled rule sets");
            Vec::new()
        };
        for entry in sources {
            let Some(name) = entry.file_name() else { continue };
            let mut compiled_name = name.to_os_string();
            compiled_name.push(COMPILED_SUFFIX);
            let compiled = compiled_dir.join(compiled_name);
            if compiled.exists() {
                continue;
            }
            let status = Command::new(&self.yarac)
                .arg(&entry)
                .arg(&compiled)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map_err(|e| DetectError::ToolUnavailable { tool: self.yarac.display().to_string(), reason: e.to_string() })?;
            if !status.success() {
                tracing::warn!(rule = %entry.display(), %status, "error compiling rule, skipping it");
                continue;
            }
            tracing::debug!(rule = %entry.display(), "compiled rule");
        }
        Ok(sorted_files(compiled_dir)?)
    }
}

impl Scanner for YaraScanner {
    fn ensure_available(&self) -> Result<(), DetectError> {
        probe_binary(&self.yara, "-h")?;
        probe_binary(&self.yarac, "-h")
    }

    fn scan(&self, rule_set: &Path, capture: &Path) -> Result<Vec<MatchRecord>, ScanError> {
        // -C compiled rules, -p worker threads, -f fast matching, -s print matched strings
        let output = Command::new(&self.yara)
            .arg("-C")
            .arg(rule_set)
            .arg(capture)
            .arg("-p")
            .arg(self.threads.to_string())
            .args(["-f", "-s"])
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ScanError::Unavailable { tool: self.yara.display().to_string(), source })?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            return Err(ScanError::Failed { rule_set: rule_set.display().to_string(), stderr: stderr.trim().to_string() });
        }
        Ok(parse_scan_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn sorted_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Parses `yara -s` output.
///
/// A rule line reads `<rule> <target>`; each hit under it reads
/// `0x<offset>:$<variable>: <text>`. Hits are attributed to the last rule line
/// seen, and any colons inside the text split it into separate strings.
pub fn parse_scan_output(text: &str) -> Vec<MatchRecord> {
    let mut out = Vec::new();
    let mut rule: Option<String> = None;
    for line in text.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()) {
        if let Some((offset, rest)) = split_hit(line) {
            let Some(rule_name) = rule.clone() else {
                tracing::warn!(line, "hit before any rule line, skipping");
                continue;
            };
            let mut fields = rest.split(':');
            let variable = fields.next().unwrap_or_default().trim().trim_start_matches('$').to_string();
            let matched_strings: Vec<String> = fields.map(|s| s.trim().to_string()).collect();
            if matched_strings.is_empty() {
                tracing::warn!(line, "hit without matched text, skipping");
                continue;
            }
            out.push(MatchRecord { rule_name, variable, offset, matched_strings });
        } else if let Some(name) = line.split_whitespace().next() {
            rule = Some(name.to_string());
        }
    }
    out
}

/// `0x4e15c:rest` -> `(0x4e15c, "rest")`.
fn split_hit(line: &str) -> Option<(u64, &str)> {
    let (head, rest) = line.trim_start().split_once(':')?;
    let hex = head.strip_prefix("0x").or_else(|| head.strip_prefix("0X"))?;
    let offset = u64::from_str_radix(hex, 16).ok()?;
    Some((offset, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tshark::tests::spawn_guard;
    #[cfg(unix)]
    use crate::tshark::tests::stub_tool;

    #[test]
    fn parses_rule_and_hits() {
        let out = "gps_location /captures/a.pcap\n\
                   0x4e15c:$rgx_gps_loc: ll=12.34,-56.78\n\
                   0x4e200:$rgx_gps_lat: lat=12.34\n";
        let hits = parse_scan_output(out);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].rule_name, "gps_location");
        assert_eq!(hits[0].variable, "rgx_gps_loc");
        assert_eq!(hits[0].offset, 0x4e15c);
        assert_eq!(hits[0].matched_strings, vec!["ll=12.34,-56.78".to_string()]);
        assert_eq!(hits[1].offset, 0x4e200);
    }

    #[test]
    fn colons_split_matched_text() {
        let hits = parse_scan_output("r t\n0x10:$v: a:b: c\n");
        assert_eq!(hits[0].matched_strings, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_output_is_no_match() {
        assert!(parse_scan_output("").is_empty());
        assert!(parse_scan_output("\n\n").is_empty());
    }

    #[test]
    fn several_rules_in_one_set() {
        let out = "rule_a cap.pcap\n0x1:$x: one\nrule_b cap.pcap\n0x2:$y: two\n";
        let hits = parse_scan_output(out);
        assert_eq!(hits.iter().map(|h| h.rule_name.as_str()).collect::<Vec<_>>(), vec!["rule_a", "rule_b"]);
    }

    #[test]
    fn malformed_hit_lines_are_skipped() {
        let hits = parse_scan_output("0x5:$v: orphan\nrule c\n0x6:$v\n0x7:$v: ok\n");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].offset, 7);
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let _guard = spawn_guard();
        let s = YaraScanner::new("/nonexistent/yara-bin", "/nonexistent/yarac-bin", 1);
        assert!(matches!(s.ensure_available(), Err(DetectError::ToolUnavailable { .. })));
        let err = s.scan(Path::new("rules"), Path::new("cap.pcap")).unwrap_err();
        assert!(matches!(err, ScanError::Unavailable { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn compiles_each_rule_once_and_skips_failures() {
        let _guard = spawn_guard();
        let tmp = tempfile::tempdir().unwrap();
        let rules = tmp.path().join("rules");
        let compiled = tmp.path().join("compiled");
        fs::create_dir_all(&rules).unwrap();
        fs::create_dir_all(&compiled).unwrap();
        for name in ["c.yara", "a.yara", "bad.yara"] {
            fs::write(rules.join(name), format!("rule {name}")).unwrap();
        }
        fs::write(compiled.join("c.yara_compiled"), "precompiled").unwrap();
        let log = tmp.path().join("yarac.log");
        let yarac = stub_tool(
            tmp.path(),
            "yarac",
            &format!(
                "echo \"$1\" >> '{}'\ncase \"$1\" in *bad*) echo 'syntax error' >&2; exit 1;; esac\ncp \"$1\" \"$2\"",
                log.display()
            ),
        );
        let scanner = YaraScanner::new("yara", yarac, 1);

        let sets = scanner.prepare_rule_sets(&rules, &compiled).unwrap();
        assert_eq!(sets, vec![compiled.join("a.yara_compiled"), compiled.join("c.yara_compiled")]);
        assert_eq!(fs::read_to_string(compiled.join("c.yara_compiled")).unwrap(), "precompiled");
        assert_eq!(fs::read_to_string(compiled.join("a.yara_compiled")).unwrap(), "rule a.yara");
        let calls = fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().count(), 2);
        assert!(!calls.contains("c.yara"));

        // only the rule that still has no compiled file is retried
        scanner.prepare_rule_sets(&rules, &compiled).unwrap();
        let calls = fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().count(), 3);
        assert!(calls.lines().last().unwrap().ends_with("bad.yara"));
    }

    #[cfg(unix)]
    #[test]
    fn missing_rules_dir_keeps_compiled_sets() {
        let _guard = spawn_guard();
        let tmp = tempfile::tempdir().unwrap();
        let compiled = tmp.path().join("compiled");
        fs::create_dir_all(&compiled).unwrap();
        fs::write(compiled.join("gps_compiled"), "x").unwrap();
        let scanner = YaraScanner::new("yara", "/nonexistent/yarac-bin", 1);
        let sets = scanner.prepare_rule_sets(&tmp.path().join("no-rules"), &compiled).unwrap();
        assert_eq!(sets, vec![compiled.join("gps_compiled")]);
    }

    #[cfg(unix)]
    #[test]
    fn scan_passes_arguments_and_parses_hits() {
        let _guard = spawn_guard();
        let tmp = tempfile::tempdir().unwrap();
        let yara = stub_tool(
            tmp.path(),
            "yara",
            "echo \"gps_location $3\"\necho \"0x10:\\$rgx_gps_loc: ll=12.34,-56.78\"\necho \"0x20:\\$threads: $1 $5 $6 $7\"",
        );
        let scanner = YaraScanner::new(yara, "yarac", 3);
        let hits = scanner.scan(Path::new("rules/compiled/gps_compiled"), Path::new("cap.pcap")).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].rule_name, "gps_location");
        assert_eq!(hits[0].variable, "rgx_gps_loc");
        assert_eq!(hits[0].offset, 0x10);
        assert_eq!(hits[1].matched_strings, vec!["-C 3 -f -s".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn scanner_stderr_fails_the_rule_set() {
        let _guard = spawn_guard();
        let tmp = tempfile::tempdir().unwrap();
        let yara = stub_tool(tmp.path(), "yara", "echo 'r cap.pcap'\necho '0x10:$v: hit'\necho 'warning: slow' >&2");
        let scanner = YaraScanner::new(yara, "yarac", 1);
        match scanner.scan(Path::new("r"), Path::new("cap.pcap")) {
            Err(ScanError::Failed { rule_set, stderr }) => {
                assert_eq!(rule_set, "r");
                assert_eq!(stderr, "warning: slow");
            }
            other => panic!("expected a failed scan, got {other:?}"),
        }
    }
}
