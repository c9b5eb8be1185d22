//! Writes the per-step tool-permission settings file consumed by the
//! adapter subprocess's own enforcement mechanism.

use std::path::Path;

use serde::Serialize;

#[derive(Debug, Serialize)]
struct SettingsFile<'a> {
    allow: &'a [String],
    deny: &'a [String],
}

/// Write `.wave-settings.json` into the workspace before spawning the
/// adapter. The adapter subprocess is expected to enforce these patterns
/// itself; violations come back as `AdapterError::SecurityViolation`.
pub fn write_settings_file(workspace_path: &Path, allowed_tools: &[String], deny_tools: &[String]) -> std::io::Result<()> {
    let settings = SettingsFile {
        allow: allowed_tools,
        deny: deny_tools,
    };
    let json = serde_json::to_string_pretty(&settings).expect("settings file is always serializable");
    std::fs::write(workspace_path.join(".wave-settings.json"), json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_allow_and_deny_lists() {
        let dir = TempDir::new().unwrap();
        write_settings_file(dir.path(), &["Read".to_string()], &["Bash(rm -rf /*)".to_string()]).unwrap();
        let content = std::fs::read_to_string(dir.path().join(".wave-settings.json")).unwrap();
        assert!(content.contains("Read"));
        assert!(content.contains("rm -rf"));
    }
}
