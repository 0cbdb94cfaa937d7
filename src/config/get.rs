use anyhow::{bail, Result};

use crate::args::BaseArgs;
use crate::settings::UploadSettings;

/// Prints one value. Without a scope this is the effective value a run would
/// use, defaults included; with `--global`/`--local` it is that file's entry.
pub fn run(base: BaseArgs, key: &str, global: bool, local: bool) -> Result<()> {
    let value = if global {
        super::load_global()?.get_field(key)
    } else if local {
        super::local_path().and_then(|path| super::load_file(&path).get_field(key))
    } else {
        UploadSettings::resolve(&base)?.field(key)
    };

    let Some(value) = value else {
        bail!("{key} is not set");
    };
    if base.json {
        println!("{}", serde_json::to_string(&value)?);
    } else {
        println!("{value}");
    }
    Ok(())
}
