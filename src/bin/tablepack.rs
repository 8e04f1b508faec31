//! Command-line front end over file-backed stores: one JSON store file per
//! engine, with remotes resolved through the configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use colored::Colorize;

use tablepack::config::Config;
use tablepack::core::diff::DiffResult;
use tablepack::core::repository::{CommitOptions, ImportOptions, Repository};
use tablepack::core::sync::{RemoteLookup, clone_repository};
use tablepack::errors::StoreError;
use tablepack::hash::ObjectHash;

#[derive(Parser)]
#[command(name = "tablepack", about = "Versioned, content-addressed table storage")]
struct Cli {
    /// Path of the local store file (overrides the configuration).
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize an empty repository.
    Init { repository: String },
    /// Commit pending changes as a new image.
    Commit {
        repository: String,
        #[arg(short, long)]
        message: Option<String>,
        /// Store full snapshots instead of delta compression.
        #[arg(long)]
        snap_only: bool,
        /// Rows per base fragment (0 disables chunking).
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Split changesets along existing fragment boundaries.
        #[arg(long)]
        split_changeset: bool,
    },
    /// Materialize an image into the working schema.
    Checkout {
        repository: String,
        /// Image hash or tag.
        image: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Delete the working schema, keeping all metadata.
    Uncheckout {
        repository: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Compare a table between two images, or an image and staging.
    Diff {
        repository: String,
        table: String,
        /// Image hash or tag; omit for the staging area.
        image_a: Option<String>,
        image_b: Option<String>,
        #[arg(long)]
        aggregate: bool,
    },
    /// Import tables from another repository on the same store.
    Import {
        repository: String,
        source_repository: String,
        /// Target table names.
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        /// Source table names, or queries where --queries marks them.
        #[arg(long, value_delimiter = ',')]
        source_tables: Vec<String>,
        /// Source image hash; the source HEAD by default.
        #[arg(long)]
        image: Option<String>,
        /// Copy source working tables instead of a source image.
        #[arg(long)]
        foreign: bool,
        /// Mask marking which source entries are queries.
        #[arg(long, value_delimiter = ',')]
        queries: Vec<bool>,
        #[arg(long)]
        no_checkout: bool,
    },
    /// Upload local changes to a remote.
    Push {
        repository: String,
        /// Configured remote name; the upstream by default.
        #[arg(long)]
        remote: Option<String>,
        #[arg(long, default_value = "DB")]
        handler: String,
        /// Handler parameters as a JSON object.
        #[arg(long)]
        handler_options: Option<String>,
    },
    /// Download new changes from the upstream.
    Pull {
        repository: String,
        #[arg(long)]
        download_all: bool,
    },
    /// Clone a repository from a configured remote.
    Clone {
        remote: String,
        repository: String,
        /// Local name; same as the remote one by default.
        #[arg(long)]
        local: Option<String>,
        #[arg(long)]
        download_all: bool,
    },
    /// Summarize a tagged, pushed image into the remote catalog.
    Publish {
        repository: String,
        tag: String,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long, default_value = "")]
        readme: String,
        #[arg(long)]
        no_provenance: bool,
        #[arg(long)]
        no_previews: bool,
    },
    /// Tag an image, or delete a tag.
    Tag {
        repository: String,
        tag: String,
        /// Image hash; HEAD by default.
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        delete: bool,
    },
    /// Delete a repository.
    Delete {
        repository: String,
        /// Keep the checked-out working schema.
        #[arg(long)]
        keep_checkout: bool,
        /// Keep images, tags and object metadata.
        #[arg(long)]
        keep_metadata: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err.to_string().red());
            if err.is_user_error() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

/// Resolve an image reference: a 64-hex hash, the literal HEAD, or a tag.
fn resolve_image(repo: &Repository, reference: &str) -> Result<ObjectHash, StoreError> {
    if let Ok(hash) = ObjectHash::from_str(reference) {
        return Ok(repo.images().by_hash(&hash)?.image_hash);
    }
    match repo.images().by_tag(reference, true)? {
        Some(image) => Ok(image.image_hash),
        None => Err(StoreError::TagNotFound(
            reference.to_string(),
            repo.to_schema(),
        )),
    }
}

fn run(cli: Cli) -> Result<(), StoreError> {
    let mut config = Config::load()?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    let engine = config.open_store()?;

    match cli.command {
        Command::Init { repository } => {
            let repo = Repository::from_schema(&repository, engine.clone());
            repo.init()?;
            engine.save()?;
            println!("Initialized empty repository {repo}");
        }
        Command::Commit {
            repository,
            message,
            snap_only,
            chunk_size,
            split_changeset,
        } => {
            let repo = Repository::from_schema(&repository, engine.clone());
            let opts = CommitOptions {
                comment: message,
                snap_only,
                chunk_size: match chunk_size {
                    Some(0) => None,
                    Some(size) => Some(size),
                    None => Some(config.chunk_size),
                },
                split_changeset,
                ..Default::default()
            };
            let image = repo.commit(&opts)?;
            engine.save()?;
            println!("Committed {} as {}", repo, image.image_hash.to_color_str());
        }
        Command::Checkout {
            repository,
            image,
            force,
        } => {
            let repo = Repository::from_schema(&repository, engine.clone());
            let image_hash = resolve_image(&repo, &image)?;
            // Missing payloads come down from the upstream, when reachable.
            let source = repo
                .get_upstream()
                .and_then(|upstream| config.engine(&upstream.remote_name).ok());
            repo.checkout(&image_hash, force, source.as_deref())?;
            engine.save()?;
            println!("Checked out {}:{}", repo, image_hash.to_color_str());
        }
        Command::Uncheckout { repository, force } => {
            let repo = Repository::from_schema(&repository, engine.clone());
            repo.uncheckout(force)?;
            engine.save()?;
            println!("Discarded the working copy of {repo}");
        }
        Command::Diff {
            repository,
            table,
            image_a,
            image_b,
            aggregate,
        } => {
            let repo = Repository::from_schema(&repository, engine.clone());
            let image_a = image_a
                .map(|reference| resolve_image(&repo, &reference))
                .transpose()?;
            let image_b = image_b
                .map(|reference| resolve_image(&repo, &reference))
                .transpose()?;
            let result = repo.diff(&table, image_a.as_ref(), image_b.as_ref(), aggregate)?;
            print_diff(&table, &result);
        }
        Command::Import {
            repository,
            source_repository,
            tables,
            source_tables,
            image,
            foreign,
            queries,
            no_checkout,
        } => {
            let repo = Repository::from_schema(&repository, engine.clone());
            let source = Repository::from_schema(&source_repository, engine.clone());
            let image_hash = image
                .map(|reference| resolve_image(&source, &reference))
                .transpose()?;
            let opts = ImportOptions {
                tables,
                source_tables,
                image_hash,
                foreign_tables: foreign,
                do_checkout: !no_checkout,
                table_queries: queries,
                ..Default::default()
            };
            let target_hash = repo.import_tables(&source, &opts)?;
            engine.save()?;
            println!("Imported into {} as {}", repo, target_hash.to_color_str());
        }
        Command::Push {
            repository,
            remote,
            handler,
            handler_options,
        } => {
            let repo = Repository::from_schema(&repository, engine.clone());
            let options = match handler_options {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::Value::Null,
            };
            let remote_repo = match remote {
                Some(name) => {
                    let remote_repo =
                        Repository::from_schema(&repository, config.engine(&name)?);
                    repo.push_to(&remote_repo, &handler, &options, None)?;
                    remote_repo
                }
                None => repo.push(&config, &handler, &options, None)?,
            };
            remote_repo.engine.save()?;
            engine.save()?;
            println!("Pushed {repo} to {remote_repo}");
        }
        Command::Pull {
            repository,
            download_all,
        } => {
            let repo = Repository::from_schema(&repository, engine.clone());
            repo.pull(&config, download_all, None)?;
            engine.save()?;
            println!("Pulled new changes into {repo}");
        }
        Command::Clone {
            remote,
            repository,
            local,
            download_all,
        } => {
            let remote_engine = config.engine(&remote)?;
            let remote_repo = Repository::from_schema(&repository, remote_engine);
            let local_repo = local
                .map(|name| Repository::from_schema(&name, engine.clone()));
            let cloned = clone_repository(
                &remote_repo,
                local_repo,
                Some(engine.clone()),
                download_all,
                None,
            )?;
            engine.save()?;
            println!("Cloned {remote_repo} into {cloned}");
        }
        Command::Publish {
            repository,
            tag,
            remote,
            readme,
            no_provenance,
            no_previews,
        } => {
            let repo = Repository::from_schema(&repository, engine.clone());
            let remote_repo = match remote {
                Some(name) => Repository::from_schema(&repository, config.engine(&name)?),
                None => {
                    let upstream = repo.get_upstream().ok_or_else(|| {
                        StoreError::InvalidArgument(format!(
                            "no remote repository specified and no upstream found for {repo}"
                        ))
                    })?;
                    Repository::new(
                        upstream.remote_namespace,
                        upstream.remote_repository,
                        config.engine(&upstream.remote_name)?,
                    )
                }
            };
            repo.publish(&tag, &remote_repo, &readme, !no_provenance, !no_previews)?;
            remote_repo.engine.save()?;
            println!("Published {repo}:{tag} to {remote_repo}");
        }
        Command::Tag {
            repository,
            tag,
            image,
            delete,
        } => {
            let repo = Repository::from_schema(&repository, engine.clone());
            if delete {
                repo.images().delete_tag(&tag)?;
                engine.save()?;
                println!("Deleted tag {tag}");
            } else {
                let image_hash = match image {
                    Some(reference) => resolve_image(&repo, &reference)?,
                    None => repo.head_strict()?.image_hash,
                };
                repo.images().tag(&image_hash, &tag)?;
                engine.save()?;
                println!("Tagged {}:{} as {}", repo, image_hash.to_color_str(), tag);
            }
        }
        Command::Delete {
            repository,
            keep_checkout,
            keep_metadata,
        } => {
            let repo = Repository::from_schema(&repository, engine.clone());
            repo.delete(!keep_metadata, !keep_checkout)?;
            engine.save()?;
            println!("Deleted {repo}");
        }
    }
    Ok(())
}

fn print_diff(table: &str, result: &DiffResult) {
    match result {
        DiffResult::Added => println!("Table {table} was added"),
        DiffResult::Removed => println!("Table {table} was removed"),
        DiffResult::Aggregate(agg) => println!(
            "{}: {} added, {} removed, {} updated",
            table, agg.added, agg.removed, agg.updated
        ),
        DiffResult::Rows(changes) => {
            for (added, row) in changes {
                let rendered = row
                    .iter()
                    .map(|value| value.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                if *added {
                    println!("{}", format!("+ ({rendered})").green());
                } else {
                    println!("{}", format!("- ({rendered})").red());
                }
            }
        }
    }
}
