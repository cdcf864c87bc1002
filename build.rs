//! Renders the `gerrit-fixture` manual pages into the build output
//! directory: one page for the binary and one per subcommand, named
//! `gerrit-fixture-<subcommand>.1` after the usual git-style convention.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
#[expect(dead_code, reason = "the build script only renders the parser")]
mod cli;

use cli::Cli;

const MANUAL: &str = "gerrit-fixture manual";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;
    writeln!(stdout, "cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH")?;

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or("OUT_DIR was not set")?);
    let source = format!("gerrit-fixture {}", env!("CARGO_PKG_VERSION"));
    let date = env::var("SOURCE_DATE_EPOCH").ok();

    let root = Cli::command();
    let root_name = root.get_name().to_owned();
    render(&out_dir, &root_name, root.clone(), &source, date.as_deref())?;
    for subcommand in root.get_subcommands() {
        let page = format!("{root_name}-{}", subcommand.get_name());
        render(&out_dir, &page, subcommand.clone(), &source, date.as_deref())?;
    }
    Ok(())
}

fn render(
    out_dir: &Path,
    page: &str,
    command: Command,
    source: &str,
    date: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut man = Man::new(command)
        .title(page.to_uppercase())
        .manual(MANUAL)
        .source(source);
    if let Some(stamp) = date {
        man = man.date(stamp);
    }
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    fs::write(out_dir.join(format!("{page}.1")), buffer)?;
    Ok(())
}
