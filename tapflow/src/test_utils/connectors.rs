use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::protocol::{Message, decode};

/// Directory of executable `/bin/sh` connectors, removed when dropped.
#[derive(Debug)]
pub struct ConnectorScripts {
    dir: TempDir,
}

impl ConnectorScripts {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes an executable script called `name` running `body`.
    pub fn write(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        path
    }

    /// Extractor printing `messages`, one per line, then exiting with `exit_code`.
    ///
    /// Its arguments go to `<name>.args` and the file passed with `--state`, if any, is copied
    /// to `<name>.state`.
    pub fn extractor(&self, name: &str, messages: &[Value], exit_code: i32) -> PathBuf {
        let lines: Vec<String> = messages.iter().map(Value::to_string).collect();
        let dir = self.path().display().to_string();

        self.write(
            name,
            &format!(
                r#"printf '%s\n' "$@" > "{dir}/{name}.args"
while [ $# -gt 0 ]; do
  case "$1" in
    --state) cp "$2" "{dir}/{name}.state"; shift ;;
  esac
  shift
done
cat <<'MESSAGES'
{}
MESSAGES
exit {exit_code}"#,
                lines.join("\n")
            ),
        )
    }

    /// Loader appending its input to `<name>.out` and echoing every `STATE` line back as its
    /// acknowledgment.
    pub fn acknowledging_loader(&self, name: &str) -> PathBuf {
        let out = self.output_path(name);

        self.write(
            name,
            &format!(
                r#"while IFS= read -r line; do
  printf '%s\n' "$line" >> "{out}"
  case "$line" in
    *'"type":"STATE"'*) printf '%s\n' "$line" ;;
  esac
done"#,
                out = out.display()
            ),
        )
    }

    /// Loader appending its input to `<name>.out` without ever acknowledging.
    pub fn silent_loader(&self, name: &str, exit_code: i32) -> PathBuf {
        let out = self.output_path(name);

        self.write(
            name,
            &format!(r#"cat >> "{}"
exit {exit_code}"#, out.display()),
        )
    }

    /// Transformer forwarding its input unchanged.
    pub fn passthrough_transformer(&self, name: &str) -> PathBuf {
        self.write(name, "exec cat")
    }

    /// Bulk transfer writing an `id` cursor at `position` as the table's bookmark to the
    /// `--state` file, or failing with a reported fault for the tables in `failing`.
    pub fn fastsync(&self, name: &str, position: u64, failing: &[&str]) -> PathBuf {
        let failing_pattern = if failing.is_empty() {
            "__none__".to_string()
        } else {
            failing.join("|")
        };

        self.write(
            name,
            &format!(
                r#"table=""
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --tables) table="$2"; shift ;;
    --state) out="$2"; shift ;;
  esac
  shift
done
case "$table" in
  {failing_pattern})
    echo 'TAPFLOW_FAULT {{"kind": "CopyError", "message": "copy failed"}}' >&2
    exit 1 ;;
esac
printf '{{"bookmarks": {{"%s": {{"replication_key": "id", "replication_key_value": {position}}}}}}}' "$table" > "$out""#
            ),
        )
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        self.path().join(format!("{name}.out"))
    }

    /// Messages received by a loader created by this value.
    pub fn loader_messages(&self, name: &str) -> Vec<Message> {
        let Ok(contents) = fs::read_to_string(self.output_path(name)) else {
            return Vec::new();
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| decode(line).unwrap())
            .collect()
    }

    /// Arguments an extractor created by this value was started with.
    pub fn extractor_args(&self, name: &str) -> Vec<String> {
        fs::read_to_string(self.path().join(format!("{name}.args")))
            .map(|contents| contents.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// State file an extractor created by this value received through `--state`.
    pub fn extractor_state(&self, name: &str) -> Option<Value> {
        let contents = fs::read(self.path().join(format!("{name}.state"))).ok()?;

        Some(serde_json::from_slice(&contents).unwrap())
    }
}

impl Default for ConnectorScripts {
    fn default() -> Self {
        Self::new()
    }
}
