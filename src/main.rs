use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use pholio::app::Library;
use pholio::config::Config;
use pholio::db::ExifType;
use pholio::events::LogNotifier;
use pholio::indexing::NullFolderWatcher;
use pholio::logging;

enum Command {
    Tag {
        add: Vec<String>,
        remove: Vec<String>,
        ids: Vec<i64>,
    },
    Set {
        field: ExifType,
        value: String,
        ids: Vec<i64>,
    },
    Rescan {
        all: bool,
        folder_ids: Vec<i64>,
    },
    Cleanup,
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn exit_with(message: &str) -> ! {
    eprintln!("Error: {}", message);
    eprintln!("Run 'pholio --help' for usage.");
    std::process::exit(1);
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_ids(values: &[String]) -> Vec<i64> {
    values
        .iter()
        .map(|v| {
            v.parse()
                .unwrap_or_else(|_| exit_with(&format!("'{}' is not a numeric ID", v)))
        })
        .collect()
}

fn parse_field(name: &str) -> ExifType {
    match name {
        "caption" => ExifType::Caption,
        "description" => ExifType::Description,
        "copyright" => ExifType::Copyright,
        "rating" => ExifType::Rating,
        "rotate" => ExifType::Rotate,
        _ => exit_with(&format!("unknown field '{}'", name)),
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut rest = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("pholio {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    exit_with("--config requires a path argument");
                }
            }
            _ => rest.push(args[i].clone()),
        }
        i += 1;
    }

    let Some((name, params)) = rest.split_first() else {
        print_help();
        std::process::exit(1);
    };

    let command = match name.as_str() {
        "tag" => {
            let mut add = Vec::new();
            let mut remove = Vec::new();
            let mut ids = Vec::new();
            let mut j = 0;
            while j < params.len() {
                let target = match params[j].as_str() {
                    "--add" | "-a" => &mut add,
                    "--remove" | "-r" => &mut remove,
                    _ => {
                        ids.push(params[j].clone());
                        j += 1;
                        continue;
                    }
                };
                let Some(value) = params.get(j + 1) else {
                    exit_with(&format!("{} requires a list of tags", params[j]));
                };
                target.extend(split_list(value));
                j += 2;
            }
            if add.is_empty() && remove.is_empty() {
                exit_with("tag needs --add or --remove");
            }
            Command::Tag {
                add,
                remove,
                ids: parse_ids(&ids),
            }
        }
        "set" => {
            if params.len() < 3 {
                exit_with("set needs a field, a value and at least one ID");
            }
            Command::Set {
                field: parse_field(&params[0]),
                value: params[1].clone(),
                ids: parse_ids(&params[2..]),
            }
        }
        "rescan" => {
            let all = params.iter().any(|p| p == "--all");
            let ids: Vec<String> = params.iter().filter(|p| *p != "--all").cloned().collect();
            if !all && ids.is_empty() {
                exit_with("rescan needs --all or folder IDs");
            }
            Command::Rescan {
                all,
                folder_ids: parse_ids(&ids),
            }
        }
        "cleanup" => Command::Cleanup,
        other => exit_with(&format!("unknown command '{}'", other)),
    };

    Args {
        config_path,
        command,
    }
}

fn print_help() {
    println!(
        r#"pholio - queue metadata edits and rescans for a photo library

USAGE:
    pholio [OPTIONS] <COMMAND>

COMMANDS:
    tag --add a,b --remove c ID...      Add or remove keywords
    set FIELD VALUE ID...               Set caption, description, copyright,
                                        rating (0-5) or rotate (degrees)
    rescan --all | FOLDER_ID...         Flag folders for re-indexing
    cleanup                             Delete old written metadata operations

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PHOLIO_CONFIG       Path to config file (overrides default location)
    PHOLIO_LOG          Log filter (trace, debug, info, warn, error)

Edits are recorded in the library database and written to the files
by pholio-daemon.

See also: pholio-daemon --help"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    logging::init_stderr()?;

    let config = match args.config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };

    let library = Library::open(config, Arc::new(LogNotifier), Arc::new(NullFolderWatcher))
        .context("Failed to open library")?;

    match args.command {
        Command::Tag { add, remove, ids } => {
            let count = library.exif().update_tags(&ids, &add, &remove, None)?;
            println!("Queued {} keyword operations.", count);
        }
        Command::Set { field, value, ids } => {
            let count = library.exif().set_exif_field(&ids, field, &value, None)?;
            if count == 0 {
                bail!("None of the given images exist");
            }
            println!("Queued {} {} operations.", count, field.as_str());
        }
        Command::Rescan { all, folder_ids } => {
            let count = if all {
                library.indexing().mark_all_for_scan()?
            } else {
                library.indexing().mark_folders_for_scan(&folder_ids)?
            };
            println!("Flagged {} folders for re-indexing.", count);
        }
        Command::Cleanup => {
            let removed = library.exif().cleanup_operations()?;
            println!("Removed {} written operations.", removed);
        }
    }

    Ok(())
}
