use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::error::{ProcmanError, Result};
use crate::models::ProcessSpec;

lazy_static! {
    /// Names travel inside URL paths, so `/`, `:`, `?`, `#`, `%` and whitespace are out
    static ref NAME_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("name pattern is valid");
}

/// Declared fleet: Deputy addresses plus the processes bound to them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub deputies: Vec<String>,
    #[serde(default)]
    pub processes: Vec<ProcessSpec>,
}

impl FleetConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProcmanError::Validation(format!("malformed document: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProcmanError::Validation(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Check the whole document; every problem found is reported at once
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let mut addresses = HashSet::new();
        for address in &self.deputies {
            if address.trim().is_empty() {
                problems.push("empty deputy address".to_string());
            } else if !addresses.insert(address.as_str()) {
                problems.push(format!("deputy '{}' is listed twice", address));
            }
        }

        let mut names = HashSet::new();
        for spec in &self.processes {
            if let Err(e) = validate_spec(spec) {
                problems.push(e);
            }
            if !names.insert(spec.name.as_str()) {
                problems.push(format!("process name '{}' is not unique", spec.name));
            }
            if !addresses.contains(spec.host.as_str()) {
                problems.push(format!(
                    "process '{}' is bound to unknown deputy '{}'",
                    spec.name, spec.host
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ProcmanError::Validation(problems.join("; ")))
        }
    }

    /// Specs assigned to the Deputy at `address`, keyed by name
    pub fn specs_for(&self, address: &str) -> BTreeMap<String, ProcessSpec> {
        self.processes
            .iter()
            .filter(|spec| spec.host == address)
            .map(|spec| (spec.name.clone(), spec.clone()))
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<&ProcessSpec> {
        self.processes.iter().find(|spec| spec.name == name)
    }
}

pub fn validate_name(name: &str) -> std::result::Result<(), String> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(format!(
            "process name '{}' must match {}",
            name,
            NAME_PATTERN.as_str()
        ))
    }
}

/// Checks a single spec independent of the fleet it belongs to
pub fn validate_spec(spec: &ProcessSpec) -> std::result::Result<(), String> {
    validate_name(&spec.name)?;
    match shell_words::split(&spec.command) {
        Ok(argv) if !argv.is_empty() => {}
        Ok(_) => return Err(format!("process '{}' has an empty command", spec.name)),
        Err(e) => return Err(format!("process '{}' has an unparsable command: {}", spec.name, e)),
    }
    if spec.working_dir.trim().is_empty() {
        return Err(format!("process '{}' has an empty working_dir", spec.name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, host: &str) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            command: "sleep 30".to_string(),
            working_dir: "/tmp".to_string(),
            host: host.to_string(),
            autostart: true,
            auto_restart: false,
        }
    }

    #[test]
    fn test_parse_document() {
        let config = FleetConfig::from_json(
            r#"{
                "deputies": ["localhost:8000"],
                "processes": [
                    {"name": "echoloop", "command": "sh -c 'while true; do echo hi; sleep 1; done'",
                     "working_dir": "/tmp", "host": "localhost:8000", "autostart": true, "auto_restart": true}
                ]
            }"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.specs_for("localhost:8000").len(), 1);
        assert!(config.specs_for("other:8000").is_empty());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = FleetConfig {
            deputies: vec!["a:8000".into(), "b:8000".into()],
            processes: vec![spec("echoloop", "a:8000"), spec("echoloop", "b:8000")],
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ProcmanError::Validation(ref m) if m.contains("echoloop")));
    }

    #[test]
    fn test_unknown_host_rejected() {
        let config = FleetConfig {
            deputies: vec!["a:8000".into()],
            processes: vec![spec("dateprinter", "b:8000")],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_separator_characters_rejected() {
        for bad in ["web/1", "a:b", "has space", "", "-lead", "x?y"] {
            assert!(validate_name(bad).is_err(), "{:?} should be rejected", bad);
        }
        for good in ["echoloop", "log-rotator_2", "svc.v1"] {
            assert!(validate_name(good).is_ok());
        }
    }

    #[test]
    fn test_empty_command_rejected() {
        let mut s = spec("empty", "a:8000");
        s.command = "   ".into();
        assert!(validate_spec(&s).is_err());
        s.command = "echo 'unterminated".into();
        assert!(validate_spec(&s).is_err());
    }

    #[test]
    fn test_duplicate_deputy_rejected() {
        let config = FleetConfig {
            deputies: vec!["a:8000".into(), "a:8000".into()],
            processes: vec![],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");
        std::fs::write(&path, r#"{"deputies": ["a:8000"], "processes": []}"#).unwrap();
        let config = FleetConfig::load(&path).unwrap();
        assert_eq!(config.deputies, vec!["a:8000".to_string()]);

        assert!(FleetConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
