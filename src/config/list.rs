//! `config list`: each setting's effective value and the layer it came from.

use std::path::PathBuf;

use anyhow::Result;
use comfy_table::Cell;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{Config, KNOWN_KEYS};
use crate::args::BaseArgs;
use crate::settings::{command_line_layer, UploadSettings};
use crate::ui::{apply_column_padding, header, styled_table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Origin {
    Flag,
    Env,
    Local,
    Global,
    Default,
}

impl Origin {
    fn as_str(self) -> &'static str {
        match self {
            Origin::Flag => "flag",
            Origin::Env => "env",
            Origin::Local => "local",
            Origin::Global => "global",
            Origin::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    key: &'static str,
    value: Option<String>,
    source: Option<Origin>,
}

/// The configs that feed settings resolution, lowest priority last.
#[derive(Debug, Default)]
struct Layers {
    flags: Config,
    env: Config,
    local: Config,
    global: Config,
}

impl Layers {
    fn origin_of(&self, key: &str) -> Origin {
        if let Some(value) = self.flags.get_field(key) {
            if self.env.get_field(key).as_ref() == Some(&value) {
                Origin::Env
            } else {
                Origin::Flag
            }
        } else if self.local.get_field(key).is_some() {
            Origin::Local
        } else if self.global.get_field(key).is_some() {
            Origin::Global
        } else {
            Origin::Default
        }
    }
}

pub fn run(base: BaseArgs, global: bool, local: bool, verbose: bool) -> Result<()> {
    let global_path = super::global_path().ok();
    let local_path = super::local_path();

    let entries = if global || local {
        let (origin, path) = if global {
            (Origin::Global, global_path.as_ref())
        } else {
            (Origin::Local, local_path.as_ref())
        };
        let config = path.map(|p| super::load_file(p)).unwrap_or_default();
        scoped_entries(&config, origin, verbose)
    } else {
        let layers = Layers {
            flags: command_line_layer(&base),
            env: env_layer(),
            local: local_path
                .as_ref()
                .map(|p| super::load_file(p))
                .unwrap_or_default(),
            global: global_path
                .as_ref()
                .map(|p| super::load_file(p))
                .unwrap_or_default(),
        };
        let settings = UploadSettings::from_sources(&base, &layers.global.merge(&layers.local))?;
        effective_entries(&settings, &layers, verbose)
    };

    if base.json {
        println!("{}", format_json(&entries)?);
        return Ok(());
    }

    if verbose {
        for (label, path) in [("global", global_path), ("local", local_path)] {
            println!("{label}: {}", describe_path(path));
        }
        println!();
    }
    if entries.is_empty() {
        println!("No config values set.");
    } else {
        println!("{}", format_table(&entries));
    }
    Ok(())
}

/// Reads the `SHOTUP_*` variables for every key, so values that arrived
/// through clap's env fallback can be told apart from real flags.
fn env_layer() -> Config {
    let mut config = Config::default();
    for key in KNOWN_KEYS {
        let name = format!("SHOTUP_{}", key.to_uppercase());
        if let Ok(value) = std::env::var(&name) {
            let _ = config.set_field(key, &value);
        }
    }
    config
}

fn effective_entries(settings: &UploadSettings, layers: &Layers, verbose: bool) -> Vec<Entry> {
    KNOWN_KEYS
        .iter()
        .map(|&key| {
            let value = settings.field(key);
            let source = value.as_ref().map(|_| layers.origin_of(key));
            Entry { key, value, source }
        })
        .filter(|entry| verbose || entry.value.is_some())
        .collect()
}

fn scoped_entries(config: &Config, origin: Origin, verbose: bool) -> Vec<Entry> {
    KNOWN_KEYS
        .iter()
        .map(|&key| {
            let value = config.get_field(key);
            let source = value.as_ref().map(|_| origin);
            Entry { key, value, source }
        })
        .filter(|entry| verbose || entry.value.is_some())
        .collect()
}

fn describe_path(path: Option<PathBuf>) -> String {
    let Some(path) = path else {
        return "(none)".to_string();
    };
    let shown = std::env::current_dir()
        .ok()
        .and_then(|cwd| pathdiff::diff_paths(&path, cwd))
        .filter(|relative| !relative.starts_with(".."))
        .unwrap_or(path);
    shown.display().to_string()
}

fn format_json(entries: &[Entry]) -> Result<String> {
    let map: Map<String, Value> = entries
        .iter()
        .map(|entry| {
            let value = serde_json::json!({
                "value": entry.value,
                "source": entry.source,
            });
            (entry.key.to_string(), value)
        })
        .collect();
    Ok(serde_json::to_string(&map)?)
}

fn format_table(entries: &[Entry]) -> String {
    let mut table = styled_table();
    table.set_header(vec![header("Key"), header("Value"), header("Source")]);
    apply_column_padding(&mut table, (0, 2));
    for entry in entries {
        table.add_row(vec![
            Cell::new(entry.key),
            Cell::new(entry.value.as_deref().unwrap_or("(unset)")),
            Cell::new(entry.source.map(Origin::as_str).unwrap_or("")),
        ]);
    }
    table.to_string()
}
