//! This is the main entry point for the disk image analysis tool.
//!
//! The program provides an interactive command-line interface for analyzing disk images.
//! Users can open images, print their layout, walk and hash their filesystems, and quit.

use std::io::{self, Write};
use std::sync::Arc;

use log::{error, info, warn};
use vfs_forensics::commands::Command;
use vfs_forensics::digest::sha256_entry;
use vfs_forensics::traits::TreeDisplay;
use vfs_forensics::walk::Visit;
use vfs_forensics::{DetectOptions, Disk, Filesystem};

/// Represents the runtime state of the program.
struct RunState {
    /// The currently opened disk image.
    disk: Option<Disk>,
    /// Filesystem in inspection mode (1-based)
    fs_nb: Option<u8>,
    /// Enable the strict validation of boot sectors
    strict_validation: bool,
    /// The size of a sector
    sector_size: usize,
}

impl RunState {
    /// The selected filesystem, or every filesystem of the disk.
    fn targets(&self) -> Vec<Arc<Filesystem>> {
        let Some(disk) = self.disk.as_ref() else {
            warn!("Open disk image first");
            return vec![];
        };
        let all = disk.filesystems();
        match self.fs_nb {
            Some(nb) => all.into_iter().skip((nb as usize).saturating_sub(1)).take(1).collect(),
            None => all,
        }
    }
}

fn main() {
    if let Err(err) = stderrlog::new().module(module_path!()).module("vfs_forensics").verbosity(2).init() {
        eprintln!("Logger initialization failed: {err}");
    }

    let mut run_state = RunState {
        disk: None,
        fs_nb: None,
        strict_validation: true,
        sector_size: 512,
    };

    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            break;
        }

        let mut s = String::new();
        match io::stdin().read_line(&mut s) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                error!("Failed to read command: {err}");
                break;
            }
        }

        match Command::from_string(&s) {
            Command::Open(locator) => {
                let options = DetectOptions::default()
                    .sector_size_of(run_state.sector_size)
                    .strict(run_state.strict_validation);
                match Disk::from_locator(&locator, options) {
                    Ok(disk) => {
                        info!("{} filesystem(s) found", disk.filesystems().len());
                        run_state.disk = Some(disk);
                        run_state.fs_nb = None;
                    }
                    Err(err) => error!("{err}"),
                }
            }
            Command::Quit => break,
            Command::Print => match &run_state.disk {
                Some(disk) => {
                    if let Err(e) = disk.print_layout(3) {
                        error!("Print layout error: {e}");
                    }
                }
                None => error!("Open disk image first"),
            },
            Command::Partition(fs_nb) => {
                if let Some(disk) = &run_state.disk {
                    let count = disk.filesystems().len();
                    if fs_nb == 0 || fs_nb as usize > count {
                        error!("Invalid filesystem number. There are {count} filesystems on disk.");
                    } else {
                        run_state.fs_nb = Some(fs_nb);
                    }
                } else {
                    warn!("Open disk image first");
                }
            }
            Command::Tree => match (&run_state.disk, run_state.fs_nb) {
                (Some(disk), None) => {
                    if let Err(err) = disk.print_tree() {
                        error!("Tree printing failed: {err}");
                    }
                }
                _ => {
                    for fs in run_state.targets() {
                        match fs.display_tree(0) {
                            Ok(tree) => print!("{tree}"),
                            Err(err) => error!("Tree printing failed: {err}"),
                        }
                    }
                }
            },
            Command::List(path) => {
                for fs in run_state.targets() {
                    list_folder(&fs, &path);
                }
            }
            Command::Hash => {
                for fs in run_state.targets() {
                    hash_files(&fs);
                }
            }
            Command::Skip => run_state.strict_validation = false,
            Command::Unknown(s) => error!("Unknown command: {s:?}"),
            Command::Invalid(s) => error!("{s}"),
            Command::Empty => {}
        }
    }
}

fn list_folder(fs: &Arc<Filesystem>, path: &str) {
    let folder = match fs.lookup(path) {
        Ok(Some(folder)) => folder,
        Ok(None) => {
            warn!("{path}: no such entry");
            return;
        }
        Err(err) => {
            error!("{path}: {err}");
            return;
        }
    };

    match folder.children() {
        Ok(children) => {
            for child in children {
                let flag = match (child.is_reallocated(), child.is_deleted()) {
                    (true, _) => "R",
                    (false, true) => "D",
                    _ => "-",
                };
                let modified = child
                    .timestamps()
                    .modified
                    .map(|t| t.to_string())
                    .unwrap_or_default();
                println!(
                    "{} {:>12} {:>19} {}{}",
                    flag,
                    child.size(),
                    modified,
                    child.name(),
                    if child.is_folder() { "/" } else { "" }
                );
            }
        }
        Err(err) => error!("{path}: {err}"),
    }
}

fn hash_files(fs: &Arc<Filesystem>) {
    for visit in fs.walk() {
        let entry = match visit {
            Visit::Entry(entry) => entry,
            Visit::Recoverable { entry, error } => {
                warn!("{}: {error}", entry.path());
                entry
            }
            Visit::Fatal(err) => {
                error!("Walk aborted: {err}");
                return;
            }
        };
        if entry.is_folder() {
            continue;
        }

        match sha256_entry(&entry) {
            Ok(Some(digest)) => {
                let note = if digest.complete { "" } else { " (partial)" };
                println!("{}  {}{}", digest.sha256, entry.path(), note);
            }
            Ok(None) => warn!("{}: no recoverable content", entry.path()),
            Err(err) => {
                error!("Hashing aborted: {err}");
                return;
            }
        }
    }
}
