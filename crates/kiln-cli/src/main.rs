mod commands;

use clap::{ArgAction, Parser, Subcommand};
use clap_complete::Shell;
use commands::install::InstallArgs;
use commands::remote::RemoteAction;
use commands::remove::RemoveArgs;
use commands::upload::UploadArgs;
use commands::{split_user_channel, CmdResult, Failure};
use kiln_core::{install_signal_handler, resolve_cache_root, Engine};
use kiln_remote::HttpConnector;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Source/binary package cache with manifest-verified remotes"
)]
struct Cli {
    /// Cache directory (default: $KILN_HOME, else ~/.kiln).
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Copy a recipe directory into the cache.
    Export {
        /// Target user and channel, as user/channel.
        user_channel: String,
        /// Directory containing kilnfile.toml.
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
        /// Keep an existing source folder even if the recipe changed.
        #[arg(short, long, default_value_t = false)]
        keep_source: bool,
    },
    /// Make a binary package available, downloading or building it.
    Install {
        /// Recipe reference, name/version@user/channel.
        reference: String,
        /// Setting as key=value; repeatable.
        #[arg(short, long = "setting", value_name = "KEY=VALUE")]
        settings: Vec<String>,
        /// Option as key=value; repeatable.
        #[arg(short, long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
        /// Environment value as key=value; repeatable.
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Build policy: never, missing, outdated, or name patterns.
        /// Without a value every package is built from source.
        #[arg(short, long, num_args = 0.., value_delimiter = ',')]
        build: Option<Vec<String>>,
        /// Remote to fetch the recipe from when it is not cached.
        #[arg(short, long)]
        remote: Option<String>,
        /// Pull newer recipes and packages from their remote.
        #[arg(short, long, default_value_t = false)]
        update: bool,
    },
    /// Upload recipes and packages to a remote.
    Upload {
        /// Exact reference or pattern.
        pattern: String,
        /// Remote name (default: first configured remote).
        #[arg(short, long)]
        remote: Option<String>,
        /// Upload every finished package too.
        #[arg(long, default_value_t = false)]
        all: bool,
        /// Upload only these package IDs; needs an exact reference.
        #[arg(short, long)]
        package: Vec<String>,
        /// Overwrite newer remote content and skip the unchanged check.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Allow a pattern to match several recipes.
        #[arg(short, long, default_value_t = false)]
        confirm: bool,
        /// Extra attempts after a transient failure.
        #[arg(long)]
        retry: Option<u32>,
        /// Seconds to wait between attempts.
        #[arg(long)]
        retry_wait: Option<u64>,
    },
    /// Remove recipes, packages, builds, or sources.
    Remove {
        /// Exact reference or pattern.
        pattern: String,
        /// Remove packages (all when no IDs are given).
        #[arg(short, long, num_args = 0.., value_delimiter = ',')]
        packages: Option<Vec<String>>,
        /// Remove build folders (all when no IDs are given).
        #[arg(short, long, num_args = 0.., value_delimiter = ',')]
        builds: Option<Vec<String>>,
        /// Remove the source folder.
        #[arg(short, long, default_value_t = false)]
        src: bool,
        /// Allow several matches and ignore unknown package IDs.
        #[arg(short, long, default_value_t = false)]
        force: bool,
        /// Remove on this remote instead of locally.
        #[arg(short, long)]
        remote: Option<String>,
    },
    /// Copy a recipe to another user/channel.
    Copy {
        reference: String,
        /// Destination user/channel.
        user_channel: String,
        /// Package IDs to copy along; repeatable.
        #[arg(short, long)]
        package: Vec<String>,
        /// Copy every package.
        #[arg(long, default_value_t = false)]
        all: bool,
        /// Overwrite an existing destination.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Search the cache or a remote.
    Search {
        #[arg(default_value = "*")]
        pattern: String,
        #[arg(short, long)]
        remote: Option<String>,
        #[arg(long, default_value_t = false)]
        case_insensitive: bool,
    },
    /// Show a cached recipe and its packages.
    Info { reference: String },
    /// Compare cached recipes with their remotes.
    CheckUpdates {
        #[arg(default_value = "*")]
        pattern: String,
    },
    /// Recompute and compare every manifest in the cache.
    Verify {
        #[arg(default_value = "*")]
        pattern: String,
    },
    /// Remove build folders and abandoned staging directories.
    Gc {
        /// Only report what would be removed.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Manage remotes and recipe provenance.
    Remote {
        #[command(subcommand)]
        command: RemoteCommand,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum RemoteCommand {
    /// List remotes in lookup order.
    List,
    Add {
        name: String,
        url: String,
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        verify_ssl: bool,
        /// Insert at this position instead of appending.
        #[arg(long)]
        insert: Option<usize>,
    },
    Remove {
        name: String,
    },
    Update {
        name: String,
        url: String,
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        verify_ssl: bool,
    },
    /// List which remote each cached recipe came from.
    ListRef,
    AddRef {
        reference: String,
        remote: String,
    },
    UpdateRef {
        reference: String,
        remote: String,
    },
    RemoveRef {
        reference: String,
    },
}

impl RemoteCommand {
    fn action(&self) -> RemoteAction<'_> {
        match self {
            Self::List => RemoteAction::List,
            Self::Add {
                name,
                url,
                verify_ssl,
                insert,
            } => RemoteAction::Add {
                name,
                url,
                verify_ssl: *verify_ssl,
                insert: *insert,
            },
            Self::Remove { name } => RemoteAction::Remove { name },
            Self::Update {
                name,
                url,
                verify_ssl,
            } => RemoteAction::Update {
                name,
                url,
                verify_ssl: *verify_ssl,
            },
            Self::ListRef => RemoteAction::ListRef,
            Self::AddRef { reference, remote } | Self::UpdateRef { reference, remote } => {
                RemoteAction::AddRef { reference, remote }
            }
            Self::RemoveRef { reference } => RemoteAction::RemoveRef { reference },
        }
    }
}

fn open_engine(cache: Option<&std::path::Path>) -> Result<Engine, Failure> {
    let root = resolve_cache_root(cache)?;
    Ok(Engine::open(root, Arc::new(HttpConnector))?)
}

fn dispatch(cli: Cli) -> CmdResult {
    let json = cli.json;
    match cli.command {
        Commands::Completions { shell } => return Ok(commands::completions::run::<Cli>(shell)),
        Commands::ManPages { ref dir } => return commands::man_pages::run::<Cli>(dir),
        _ => {}
    }

    let engine = open_engine(cli.cache.as_deref())?;
    match cli.command {
        Commands::Export {
            user_channel,
            path,
            keep_source,
        } => {
            let (user, channel) = split_user_channel(&user_channel)?;
            commands::export::run(&engine, &path, user, channel, keep_source, json)
        }
        Commands::Install {
            reference,
            settings,
            options,
            env,
            build,
            remote,
            update,
        } => commands::install::run(
            &engine,
            &InstallArgs {
                reference: &reference,
                settings: &settings,
                options: &options,
                env: &env,
                build: build.as_deref(),
                remote: remote.as_deref(),
                update,
            },
            json,
        ),
        Commands::Upload {
            pattern,
            remote,
            all,
            package,
            force,
            confirm,
            retry,
            retry_wait,
        } => commands::upload::run(
            &engine,
            &UploadArgs {
                pattern: &pattern,
                remote: remote.as_deref(),
                all,
                packages: &package,
                force,
                confirm,
                retry,
                retry_wait,
            },
            json,
        ),
        Commands::Remove {
            pattern,
            packages,
            builds,
            src,
            force,
            remote,
        } => commands::remove::run(
            &engine,
            &RemoveArgs {
                pattern: &pattern,
                packages: packages.as_deref(),
                builds: builds.as_deref(),
                src,
                force,
                remote: remote.as_deref(),
            },
            json,
        ),
        Commands::Copy {
            reference,
            user_channel,
            package,
            all,
            force,
        } => commands::copy::run(&engine, &reference, &user_channel, &package, all, force, json),
        Commands::Search {
            pattern,
            remote,
            case_insensitive,
        } => commands::search::run(&engine, &pattern, remote.as_deref(), case_insensitive, json),
        Commands::Info { reference } => commands::info::run(&engine, &reference, json),
        Commands::CheckUpdates { pattern } => commands::check_updates::run(&engine, &pattern, json),
        Commands::Verify { pattern } => commands::verify::run(&engine, &pattern, json),
        Commands::Gc { dry_run } => commands::gc::run(&engine, dry_run, json),
        Commands::Remote { command } => commands::remote::run(&engine, &command.action(), json),
        Commands::Completions { .. } | Commands::ManPages { .. } => {
            Ok(commands::EXIT_SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(failure) => {
            eprintln!("error: {failure}");
            ExitCode::from(failure.code)
        }
    }
}
