use std::path::{Path, PathBuf};
use std::process::exit;

use anyhow::{Result, anyhow};
use clap::{ArgGroup, Parser, Subcommand};

use tfs_sync::config::{PolicySettings, RemoteConfigStore, read_config};
use tfs_sync::error::SyncError;
use tfs_sync::git::GitRepo;
use tfs_sync::lock::LockCoordinator;
use tfs_sync::notes::NotesStore;
use tfs_sync::orchestrator::SyncOrchestrator;
use tfs_sync::repair::NotesRepair;
use tfs_sync::tfvc::{CheckinOptions, NullTfvcClient, TfvcClient};

#[derive(Parser, Debug)]
#[command(version, author, about = "Bidirectional sync between TFVC and git")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synchronize a workspace with its TFVC server.
    #[command(group(ArgGroup::new("direction").args(["from_tfvc", "to_tfvc"]).multiple(false)))]
    Sync {
        /// Directory containing the git repository (defaults to the current directory).
        #[arg(long, value_name = "DIR")]
        workspace_root: Option<PathBuf>,

        /// Name identifying this workspace's lock; defaults to the repository's directory name.
        #[arg(long, value_name = "NAME")]
        workspace_name: Option<String>,

        /// Which configured remote to sync against (defaults to the sole configured remote).
        #[arg(long, value_name = "ID")]
        remote: Option<String>,

        /// Name of the git remote to pull from and push to.
        #[arg(long, value_name = "NAME", default_value = "origin")]
        git_remote: String,

        /// Only pull server changesets into git.
        #[arg(long)]
        from_tfvc: bool,

        /// Only push git commits to the server.
        #[arg(long)]
        to_tfvc: bool,

        /// Branch to check in from / merge into.
        #[arg(long, default_value = "HEAD")]
        target: String,

        /// Narrate the operation without mutating anything.
        #[arg(long)]
        dry_run: bool,

        /// Maximum time to wait to acquire the workspace lock.
        #[arg(long, value_name = "DURATION")]
        lock_timeout: Option<String>,

        /// Age after which a held lock is considered stale and evictable.
        #[arg(long, value_name = "DURATION")]
        max_lock_age: Option<String>,

        /// Forcibly remove an existing lock before proceeding.
        #[arg(long)]
        force_unlock: bool,

        /// Skip lock acquisition entirely (single-workspace, single-caller use only).
        #[arg(long)]
        no_lock: bool,

        /// Explicit path for the lock file, overriding the workspace-root/workspace-name pair.
        #[arg(long, value_name = "FILE")]
        lock_file: Option<PathBuf>,

        /// Override --author for every commit checked in this run.
        #[arg(long)]
        author: Option<String>,

        /// Map git author emails to TFVC identities via this file.
        #[arg(long, value_name = "FILE")]
        authors_file: Option<PathBuf>,

        /// Check in merge commits even when no merged-branch parent resolves.
        #[arg(long)]
        ignore_merge: bool,
    },
    /// Register a new TFVC remote against this git repository.
    Init {
        #[arg(long, value_name = "DIR")]
        workspace_root: Option<PathBuf>,

        /// Identifier for the new remote.
        #[arg(long)]
        id: String,

        /// TFVC server URL.
        #[arg(long)]
        url: String,

        /// TFVC server path (e.g. `$/Project/Main`).
        #[arg(long)]
        path: String,
    },
    /// Show configured remotes and their sync watermarks.
    Info {
        #[arg(long, value_name = "DIR")]
        workspace_root: Option<PathBuf>,

        /// Emit the remote descriptors as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Read-only scan for changeset ids with no resolving local commit.
    RepairNotes {
        #[arg(long, value_name = "DIR")]
        workspace_root: Option<PathBuf>,

        #[arg(long, value_name = "ID")]
        remote: Option<String>,
    },
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // clap exits usage errors with code 2 by default; spec.md's
            // exit-code table reserves 2 for unexpected exceptions and
            // wants 1 for invalid_arguments (e.g. --from-tfvc and
            // --to-tfvc together). --help/--version still exit 0.
            let code = match err.exit_code() {
                0 => 0,
                _ => 1,
            };
            err.print().ok();
            exit(code);
        }
    };

    let mut builder = env_logger::Builder::from_default_env();
    if args.debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    match run(args) {
        Ok(()) => exit(0),
        Err(err) => {
            eprintln!("error: {err}");
            if let Some(sync_err) = err.downcast_ref::<SyncError>() {
                let recs = sync_err.recommendations();
                if !recs.is_empty() {
                    eprintln!("Recommended solutions:");
                    for (i, rec) in recs.iter().enumerate() {
                        eprintln!("  {}. {rec}", i + 1);
                    }
                }
                exit(sync_err.exit_code());
            }
            exit(2);
        }
    }
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Sync {
            workspace_root,
            workspace_name,
            remote,
            git_remote,
            from_tfvc,
            to_tfvc,
            target,
            dry_run,
            lock_timeout,
            max_lock_age,
            force_unlock,
            no_lock,
            lock_file,
            author,
            authors_file,
            ignore_merge,
        } => run_sync(SyncArgs {
            workspace_root,
            workspace_name,
            remote,
            git_remote,
            from_tfvc,
            to_tfvc,
            target,
            dry_run,
            lock_timeout,
            max_lock_age,
            force_unlock,
            no_lock,
            lock_file,
            author,
            authors_file,
            ignore_merge,
        }),
        Command::Init {
            workspace_root,
            id,
            url,
            path,
        } => run_init(workspace_root, &id, &url, &path),
        Command::Info { workspace_root, json } => run_info(workspace_root, json),
        Command::RepairNotes {
            workspace_root,
            remote,
        } => run_repair_notes(workspace_root, remote),
    }
}

struct SyncArgs {
    workspace_root: Option<PathBuf>,
    workspace_name: Option<String>,
    remote: Option<String>,
    git_remote: String,
    from_tfvc: bool,
    to_tfvc: bool,
    target: String,
    dry_run: bool,
    lock_timeout: Option<String>,
    max_lock_age: Option<String>,
    force_unlock: bool,
    no_lock: bool,
    lock_file: Option<PathBuf>,
    author: Option<String>,
    authors_file: Option<PathBuf>,
    ignore_merge: bool,
}

fn repo_root(workspace_root: Option<PathBuf>) -> Result<PathBuf> {
    let root = workspace_root.unwrap_or(std::env::current_dir()?);
    Ok(dunce::canonicalize(root)?)
}

fn run_sync(sync_args: SyncArgs) -> Result<()> {
    let root = repo_root(sync_args.workspace_root)?;
    let repo = GitRepo::open(&root);
    let config = read_config(Some(&root))?;

    let lock_timeout = match &sync_args.lock_timeout {
        Some(s) => humantime::parse_duration(s).map_err(|e| SyncError::InvalidArguments {
            message: format!("invalid --lock-timeout '{s}': {e}"),
        })?,
        None => config.lock_timeout(),
    };
    let max_lock_age = match &sync_args.max_lock_age {
        Some(s) => humantime::parse_duration(s).map_err(|e| SyncError::InvalidArguments {
            message: format!("invalid --max-lock-age '{s}': {e}"),
        })?,
        None => config.max_lock_age(),
    };
    LockCoordinator::validate_bounds(lock_timeout, max_lock_age)
        .map_err(|e| SyncError::InvalidArguments { message: e.to_string() })?;

    // --lock-file overrides both the lock directory and the workspace
    // name with an explicit path; otherwise the lock lives under the
    // workspace root, named after --workspace-name or the root's
    // directory name.
    let (lock_dir, mut workspace_name) = match &sync_args.lock_file {
        Some(path) => (
            path.parent().map(Path::to_path_buf).unwrap_or_else(|| root.clone()),
            path.file_stem()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "workspace".to_string()),
        ),
        None => (
            root.clone(),
            sync_args.workspace_name.clone().unwrap_or_else(|| {
                root.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "workspace".to_string())
            }),
        ),
    };

    if sync_args.force_unlock {
        let coordinator = LockCoordinator::new(&lock_dir);
        coordinator.force_unlock(&workspace_name)?;
    }

    // --no-lock is for single-workspace, single-caller use: rather than
    // skip the coordinator's bookkeeping (every orchestrator method
    // acquires one), give this run a lock name no other invocation would
    // ever share, so acquisition is instant and never contends.
    if sync_args.no_lock {
        workspace_name = format!("{workspace_name}.nolock.{}", std::process::id());
    }

    let store = RemoteConfigStore::new(&repo);
    let remotes = store.load_all()?;
    if remotes.is_empty() {
        return Err(SyncError::PreconditionFailed {
            message: "no TFVC remote is configured for this repository".to_string(),
        }
        .into());
    }
    let remote_id = sync_args.remote.unwrap_or_else(|| remotes[0].id.clone());
    let mut remote = remotes
        .into_iter()
        .find(|r| r.id == remote_id)
        .ok_or_else(|| SyncError::PreconditionFailed {
            message: format!("no configured remote named '{remote_id}'"),
        })?;

    if sync_args.dry_run {
        println!(
            "dry run: would sync workspace '{workspace_name}' against remote '{}' ({}, {})",
            remote.id, remote.tfs_url, remote.tfs_repository_path
        );
        return Ok(());
    }

    NotesStore::new(&repo).configure_remote_to_sync(&remote.id)?;

    let mut tfvc = NullTfvcClient;
    let orchestrator = SyncOrchestrator::new(&repo, &lock_dir);
    let options = CheckinOptions {
        author: sync_args.author,
        authors_file: sync_args.authors_file,
        ignore_merge: sync_args.ignore_merge || config.ignore_merge(),
        no_build: false,
    };

    if sync_args.from_tfvc {
        let report = orchestrator.sync_from_tfvc(
            &mut tfvc,
            &workspace_name,
            lock_timeout,
            max_lock_age,
            &mut remote,
            &sync_args.target,
        )?;
        store.save(&remote)?;
        println!(
            "fetched; server max changeset {} (merge performed: {})",
            report.server_max_changeset_id, report.merge_performed
        );
    } else if sync_args.to_tfvc {
        let report = orchestrator.sync_to_tfvc(
            &mut tfvc,
            &workspace_name,
            lock_timeout,
            max_lock_age,
            &sync_args.git_remote,
            &sync_args.target,
            &mut remote,
            &options,
            false,
            config.auto_rebase(),
        )?;
        store.save(&remote)?;
        if report.bound.is_empty() {
            println!("nothing to check in");
        } else {
            println!("checked in {} commit(s)", report.bound.len());
        }
    } else {
        let report = orchestrator.sync_bidirectional(
            &mut tfvc,
            &workspace_name,
            lock_timeout,
            max_lock_age,
            &sync_args.git_remote,
            &mut remote,
            &sync_args.target,
            &options,
        )?;
        store.save(&remote)?;
        println!(
            "fetched (merge performed: {}); checked in {} commit(s)",
            report.from_tfvc.merge_performed,
            report.to_tfvc.bound.len()
        );
    }

    Ok(())
}

fn run_init(workspace_root: Option<PathBuf>, id: &str, url: &str, path: &str) -> Result<()> {
    let root = repo_root(workspace_root)?;
    let repo = GitRepo::open(&root);
    repo.rev_parse("HEAD")
        .map_err(|_| anyhow!("'{}' is not a git repository with at least one commit", root.display()))?;

    let store = RemoteConfigStore::new(&repo);
    let descriptor = tfs_sync::types::RemoteDescriptor::new(id, url, path);
    store.save(&descriptor)?;
    NotesStore::new(&repo).configure_remote_to_sync(id)?;

    println!("registered remote '{id}' ({url}, {path})");
    Ok(())
}

fn run_info(workspace_root: Option<PathBuf>, json: bool) -> Result<()> {
    let root = repo_root(workspace_root)?;
    let repo = GitRepo::open(&root);
    let store = RemoteConfigStore::new(&repo);

    let remotes = store.load_all()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&remotes)?);
        return Ok(());
    }

    if remotes.is_empty() {
        println!("no remotes configured");
        return Ok(());
    }

    for remote in &remotes {
        println!(
            "{}: {} {} (watermark: changeset {}, commit {})",
            remote.id,
            remote.tfs_url,
            remote.tfs_repository_path,
            remote.max_changeset_id,
            remote.max_commit_hash.as_ref().map(|h| h.to_string()).unwrap_or_else(|| "none".to_string()),
        );
    }

    Ok(())
}

fn run_repair_notes(workspace_root: Option<PathBuf>, remote_id: Option<String>) -> Result<()> {
    let root = repo_root(workspace_root)?;
    let repo = GitRepo::open(&root);
    let store = RemoteConfigStore::new(&repo);

    let remotes = store.load_all()?;
    if remotes.is_empty() {
        return Err(SyncError::PreconditionFailed {
            message: "no TFVC remote is configured for this repository".to_string(),
        }
        .into());
    }
    let remote_id = remote_id.unwrap_or_else(|| remotes[0].id.clone());

    let tfvc: Box<dyn TfvcClient> = Box::new(NullTfvcClient);
    let repair = NotesRepair::new(&repo);
    let report = repair.check(tfvc.as_ref(), &remote_id, None)?;

    println!("checked {} changeset(s)", report.checked);
    if report.unresolved.is_empty() {
        println!("no gaps found");
    } else {
        println!("{} changeset(s) with no resolving commit:", report.unresolved.len());
        for unresolved in &report.unresolved {
            println!("  C{}", unresolved.changeset_id);
        }
    }

    Ok(())
}
