mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use cleanroom_inject::EntryPoint;
use commands::{
    Connection, TransferArgs, EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_NOT_FOUND,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "cleanroom",
    version,
    about = "Ephemeral container test environments with verified code injection"
)]
struct Cli {
    /// Project file. Defaults to ./cleanroom.toml when it exists.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Runtime backend, overriding [run].backend (lxd or mock).
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Worker threads for parallel operations.
    #[arg(long, global = true)]
    threads: Option<usize>,

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
    /// Run a test payload with one of the execution strategies.
    Run {
        /// serial, serial-target, parallel or parallel-target.
        #[arg(long, default_value = "serial")]
        strategy: String,
        /// Payload name; fresh instances are named <name>-<image>.
        #[arg(long)]
        name: String,
        /// File holding the payload source.
        #[arg(long)]
        source: PathBuf,
        /// Invocation appended after the source.
        #[arg(long)]
        entry: String,
        /// Interpreter for the testlet shebang.
        #[arg(long, default_value = "/bin/sh")]
        interpreter: String,
        /// Image config to build from (fresh strategies). Repeatable.
        #[arg(long = "image")]
        images: Vec<String>,
        /// Existing instance to run in (target strategies). Repeatable.
        #[arg(long = "target")]
        targets: Vec<String>,
        /// Keep fresh instances after the run.
        #[arg(long, default_value_t = false)]
        preserve: bool,
        /// Shell script run in fresh instances before start hooks.
        #[arg(long)]
        provision: Option<PathBuf>,
    },
    /// Execute a command in one or more instances.
    Exec {
        #[arg(required = true)]
        targets: Vec<String>,
        /// Command and arguments to run (after --).
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
    /// Copy a file or directory from the host into an instance.
    Push {
        target: String,
        src: PathBuf,
        dest: PathBuf,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Copy a file or directory from an instance onto the host.
    Pull {
        target: String,
        src: PathBuf,
        dest: PathBuf,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Run stop hooks, then stop and delete instances.
    Destroy {
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// Stop and start instances again.
    Restart {
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// List known instance configs.
    Configs,
    /// Print the public address of an instance.
    Address {
        target: String,
        /// Look for an IPv6 address instead of IPv4.
        #[arg(long, default_value_t = false)]
        ipv6: bool,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// In-instance entry point invoked by bootstrap scripts.
    #[command(hide = true)]
    Agent {
        entry: EntryPoint,
        #[arg(long)]
        checksum: String,
        /// File holding the base64 payload.
        #[arg(long)]
        payload: PathBuf,
    },
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
            tracing_subscriber::EnvFilter::try_from_env("CLEANROOM_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let json_output = cli.json;
    let conn = Connection {
        config: cli.config,
        backend: cli.backend,
        threads: cli.threads,
    };

    let result = match cli.command {
        Commands::Run {
            strategy,
            name,
            source,
            entry,
            interpreter,
            images,
            targets,
            preserve,
            provision,
        } => commands::run::run(
            &conn,
            &commands::run::RunArgs {
                strategy,
                name,
                source,
                entry,
                interpreter,
                images,
                targets,
                preserve,
                provision,
            },
            json_output,
        ),
        Commands::Exec { targets, command } => {
            commands::exec::run(&conn, &targets, &command, json_output)
        }
        Commands::Push {
            target,
            src,
            dest,
            transfer,
        } => commands::push::run(&conn, &target, &src, &dest, &transfer, json_output),
        Commands::Pull {
            target,
            src,
            dest,
            transfer,
        } => commands::pull::run(&conn, &target, &src, &dest, &transfer, json_output),
        Commands::Destroy { targets } => commands::destroy::run(&conn, &targets, json_output),
        Commands::Restart { targets } => commands::restart::run(&conn, &targets, json_output),
        Commands::Configs => commands::configs::run(&conn, json_output),
        Commands::Address { target, ipv6 } => {
            commands::address::run(&conn, &target, ipv6, json_output)
        }
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::Agent {
            entry,
            checksum,
            payload,
        } => commands::agent::run(entry, &checksum, &payload),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("configuration error:")
                || msg.starts_with("project file error:")
            {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("instance not found:") {
                EXIT_NOT_FOUND
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
