use std::path::Path;
use tapflow_config::shared::{
    ConnectorDefinition, ExtractorDefinition, FastSyncDefinition, LoaderDefinition,
};

use crate::connector::catalog_flag;
use crate::process::supervisor::{ConnectorRole, ProcessSpec};

fn base_spec<K>(role: ConnectorRole, definition: &ConnectorDefinition<K>) -> ProcessSpec {
    let mut args = definition.args.clone();
    args.push("--config".to_string());
    args.push(definition.config_path.display().to_string());

    ProcessSpec {
        role,
        program: definition.command.clone(),
        args,
        env: definition.env.clone(),
    }
}

/// `<command> <args> --config <cfg> --catalog|--properties <catalog> [--state <state>]`
pub fn extractor_spec(
    definition: &ExtractorDefinition,
    catalog: &Path,
    state: Option<&Path>,
) -> ProcessSpec {
    let mut spec = base_spec(ConnectorRole::Extractor, definition);
    spec.args.push(catalog_flag(definition.kind).to_string());
    spec.args.push(catalog.display().to_string());

    if let Some(state) = state {
        spec.args.push("--state".to_string());
        spec.args.push(state.display().to_string());
    }

    spec
}

/// `<command> <args> --config <cfg>`
pub fn stage_spec<K>(role: ConnectorRole, definition: &ConnectorDefinition<K>) -> ProcessSpec {
    base_spec(role, definition)
}

/// `<command> <args> --tap <extractor cfg> --target <loader cfg> --tables <stream> --state <out>`
pub fn fastsync_spec(
    fastsync: &FastSyncDefinition,
    extractor: &ExtractorDefinition,
    loader: &LoaderDefinition,
    stream: &str,
    output: &Path,
) -> ProcessSpec {
    let mut args = fastsync.args.clone();
    args.extend([
        "--tap".to_string(),
        extractor.config_path.display().to_string(),
        "--target".to_string(),
        loader.config_path.display().to_string(),
        "--tables".to_string(),
        stream.to_string(),
        "--state".to_string(),
        output.display().to_string(),
    ]);

    ProcessSpec {
        role: ConnectorRole::FastSync,
        program: fastsync.command.clone(),
        args,
        env: fastsync.env.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tapflow_config::shared::{ExtractorKind, LoaderKind};

    fn extractor(kind: ExtractorKind) -> ExtractorDefinition {
        ExtractorDefinition {
            kind,
            command: "tap".to_string(),
            args: vec!["--debug".to_string()],
            env: BTreeMap::new(),
            config_path: PathBuf::from("/etc/tap.json"),
        }
    }

    #[test]
    fn extractor_gets_state_only_when_present() {
        let first = extractor_spec(&extractor(ExtractorKind::Custom), Path::new("c.json"), None);
        assert_eq!(
            first.args,
            vec!["--debug", "--config", "/etc/tap.json", "--catalog", "c.json"]
        );

        let resumed = extractor_spec(
            &extractor(ExtractorKind::Postgres),
            Path::new("c.json"),
            Some(Path::new("state.json")),
        );
        assert_eq!(
            resumed.args,
            vec![
                "--debug",
                "--config",
                "/etc/tap.json",
                "--properties",
                "c.json",
                "--state",
                "state.json"
            ]
        );
    }

    #[test]
    fn fastsync_names_one_table() {
        let loader = LoaderDefinition {
            kind: LoaderKind::Postgres,
            command: "target".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            config_path: PathBuf::from("/etc/target.json"),
        };
        let fastsync = FastSyncDefinition {
            command: "fastsync".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            max_parallel_tables: 2,
        };

        let spec = fastsync_spec(
            &fastsync,
            &extractor(ExtractorKind::Postgres),
            &loader,
            "public-users",
            Path::new("out.json"),
        );

        assert_eq!(spec.role, ConnectorRole::FastSync);
        assert_eq!(
            spec.args,
            vec![
                "--tap",
                "/etc/tap.json",
                "--target",
                "/etc/target.json",
                "--tables",
                "public-users",
                "--state",
                "out.json"
            ]
        );
    }
}
