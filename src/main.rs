//! `ags`: command-line access to remote agent sandboxes.

use ags_sandbox::{
    Callbacks, CancellationToken, Client, ClientConfig, ConnectOptions, CreateCodeContextConfig,
    CreateOptions, Credential, FileOptions, ListDirOptions, ListOptions, OutputSink,
    ProcessConfig, ProcessOptions, RunCodeConfig, Sandbox, SandboxStatus,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ags", author, version, about = "Manage remote agent sandboxes", long_about = None)]
struct Cli {
    /// Config file (defaults to the per-user config dir)
    #[arg(long, global = true, env = "AGS_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision a sandbox and print its id
    Create {
        /// Tool profile
        #[arg(long, default_value = ags_sandbox::config::DEFAULT_TOOL)]
        tool: String,
        /// Lifetime in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Metadata entries (format: key=value)
        #[arg(long = "metadata", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },
    /// List live sandboxes
    List {
        /// Only sandboxes in this state (running, paused)
        #[arg(long)]
        state: Option<String>,
    },
    /// Show one sandbox
    Info { sandbox_id: String },
    /// Terminate a sandbox
    Kill { sandbox_id: String },
    /// Run a code snippet in the sandbox's interpreter
    RunCode {
        sandbox_id: String,
        code: String,
        /// Interpreter language (default context of that language)
        #[arg(long, conflicts_with = "context")]
        language: Option<String>,
        /// Existing code context id
        #[arg(long)]
        context: Option<String>,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Run a shell command in the sandbox
    Exec {
        sandbox_id: String,
        /// In-sandbox user
        #[arg(long, default_value = ags_sandbox::config::DEFAULT_USER)]
        user: String,
        /// Working directory
        #[arg(long)]
        cwd: Option<String>,
        /// Print the pid and return without waiting
        #[arg(long)]
        background: bool,
        /// Command line, passed to the shell
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// List processes inside the sandbox
    Ps {
        sandbox_id: String,
        /// In-sandbox user
        #[arg(long, default_value = ags_sandbox::config::DEFAULT_USER)]
        user: String,
    },
    /// Send a signal to a process inside the sandbox
    Signal {
        sandbox_id: String,
        pid: u32,
        /// In-sandbox user the process runs as
        #[arg(long, default_value = ags_sandbox::config::DEFAULT_USER)]
        user: String,
        /// Signal number
        #[arg(long, default_value_t = ags_sandbox::SIGTERM)]
        signal: i32,
    },
    /// Filesystem operations
    Fs {
        sandbox_id: String,
        /// In-sandbox user
        #[arg(long, global = true, default_value = ags_sandbox::config::DEFAULT_USER)]
        user: String,
        #[command(subcommand)]
        op: FsCommand,
    },
    /// Walk through code, command and filesystem calls in a throwaway sandbox
    Demo {
        /// Tool profile
        #[arg(long, default_value = ags_sandbox::config::DEFAULT_TOOL)]
        tool: String,
    },
}

#[derive(Subcommand)]
enum FsCommand {
    /// List a directory
    Ls {
        path: String,
        #[arg(long, default_value_t = 1)]
        depth: u32,
    },
    /// Print a file
    Cat { path: String },
    /// Upload a local file
    Put { local: String, remote: String },
    /// Show file metadata
    Stat { path: String },
    /// Check whether a path exists
    Exists { path: String },
    /// Move a file or directory
    Mv { from: String, to: String },
    /// Create a directory
    Mkdir { path: String },
    /// Delete a file or directory
    Rm { path: String },
}

fn parse_key_value(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    anyhow::ensure!(!key.is_empty(), "empty key in {raw:?}");
    Ok((key.to_string(), value.to_string()))
}

/// Echo streamed output to the terminal as it arrives.
fn terminal_sink() -> OutputSink {
    Callbacks::new()
        .on_stdout(|chunk| {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(chunk);
            let _ = out.flush();
        })
        .on_stderr(|chunk| {
            let mut err = std::io::stderr().lock();
            let _ = err.write_all(chunk);
            let _ = err.flush();
        })
        .into_sink()
}

/// Cancellation token fired by Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let fired = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            fired.cancel();
        }
    });
    token
}

async fn connect(client: &Client, sandbox_id: &str) -> Result<Sandbox> {
    Sandbox::connect(client, sandbox_id, ConnectOptions::default())
        .await
        .with_context(|| format!("cannot connect to sandbox {sandbox_id}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ags_sandbox=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = ClientConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let credential = Credential::from_env(&config)?;
    let client = Client::new(credential, config)?;

    match cli.command {
        Command::Create {
            tool,
            timeout,
            metadata,
        } => {
            let mut options = CreateOptions::new();
            if let Some(secs) = timeout {
                options = options.timeout(Duration::from_secs(secs));
            }
            for raw in &metadata {
                let (key, value) = parse_key_value(raw)?;
                options = options.metadata(key, value);
            }
            let sandbox = Sandbox::create(&client, &tool, options).await?;
            println!("{}", sandbox.id());
        }
        Command::List { state } => {
            let mut options = ListOptions::new();
            if let Some(state) = state {
                options = options.status(SandboxStatus::from(state));
            }
            for summary in Sandbox::list(&client, &options).await? {
                println!(
                    "{}\t{}\t{}",
                    summary.sandbox_id,
                    summary.status,
                    summary.template_id.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Info { sandbox_id } => {
            let info = Sandbox::info_by_id(&client, &sandbox_id).await?;
            println!("id:       {}", info.sandbox_id);
            println!("status:   {}", info.status);
            println!("template: {}", info.template_id.as_deref().unwrap_or("-"));
            if let Some(started) = info.started_at {
                println!("started:  {}", started.to_rfc3339());
            }
            if let Some(end) = info.end_at {
                println!("expires:  {}", end.to_rfc3339());
            }
        }
        Command::Kill { sandbox_id } => {
            Sandbox::kill_by_id(&client, &sandbox_id).await?;
            println!("Sandbox {sandbox_id} terminated.");
        }
        Command::RunCode {
            sandbox_id,
            code,
            language,
            context,
            timeout,
        } => {
            let sandbox = connect(&client, &sandbox_id).await?;
            let mut run = RunCodeConfig::new().cancel(ctrl_c_token());
            if let Some(language) = language {
                run = run.language(language);
            }
            if let Some(context) = context {
                run = run.context_id(context);
            }
            if let Some(secs) = timeout {
                run = run.timeout(Duration::from_secs(secs));
            }
            let exec = sandbox.code().run_code(&code, run, Some(terminal_sink())).await?;
            if let Some(text) = exec.text() {
                println!("{text}");
            }
            if let Some(error) = exec.error {
                eprintln!("{}: {}\n{}", error.name, error.value, error.traceback);
                std::process::exit(1);
            }
        }
        Command::Exec {
            sandbox_id,
            user,
            cwd,
            background,
            command,
        } => {
            let sandbox = connect(&client, &sandbox_id).await?;
            let mut process = ProcessConfig::new().user(user);
            if let Some(cwd) = cwd {
                process = process.cwd(cwd);
            }
            let cmd = command.join(" ");
            if background {
                let handle = sandbox.commands().start(&cmd, process, None).await?;
                println!("{}", handle.pid());
                handle.disconnect().await;
            } else {
                let process = process.cancel(ctrl_c_token());
                let result = sandbox
                    .commands()
                    .run(&cmd, process, Some(terminal_sink()))
                    .await?;
                if let Some(error) = &result.error {
                    eprintln!("error: {error}");
                }
                if result.exit_code != 0 {
                    std::process::exit(result.exit_code);
                }
            }
        }
        Command::Ps { sandbox_id, user } => {
            let sandbox = connect(&client, &sandbox_id).await?;
            for process in sandbox.commands().list(&ProcessOptions::user(user)).await? {
                println!(
                    "{}\t{}\t{} {}",
                    process.pid,
                    process.cwd.as_deref().unwrap_or("-"),
                    process.cmd,
                    process.args.join(" ")
                );
            }
        }
        Command::Signal {
            sandbox_id,
            pid,
            user,
            signal,
        } => {
            let sandbox = connect(&client, &sandbox_id).await?;
            sandbox
                .commands()
                .send_signal(pid, signal, &ProcessOptions::user(user))
                .await?;
        }
        Command::Fs {
            sandbox_id,
            user,
            op,
        } => {
            let sandbox = connect(&client, &sandbox_id).await?;
            run_fs(&sandbox, FileOptions::user(user), op).await?;
        }
        Command::Demo { tool } => {
            Sandbox::scoped(&client, &tool, CreateOptions::new(), demo).await?;
        }
    }

    Ok(())
}

async fn run_fs(sandbox: &Sandbox, options: FileOptions, op: FsCommand) -> Result<()> {
    let files = sandbox.files();
    match op {
        FsCommand::Ls { path, depth } => {
            let list = ListDirOptions::new().depth(depth).user(options.user.clone());
            for entry in files.list(&path, &list).await? {
                let kind = if entry.is_dir() { "dir " } else { "file" };
                println!("{kind}\t{:>10}\t{}", entry.size, entry.path);
            }
        }
        FsCommand::Cat { path } => {
            let mut stream = files.read_stream(&path, &options).await?;
            let mut out = std::io::stdout().lock();
            while let Some(chunk) = stream.chunk().await? {
                out.write_all(&chunk)?;
            }
            out.flush()?;
        }
        FsCommand::Put { local, remote } => {
            let local = shellexpand::tilde(&local).into_owned();
            let content = tokio::fs::read(&local)
                .await
                .with_context(|| format!("cannot read {local}"))?;
            let info = files.write(&remote, content, &options).await?;
            println!("{}", info.path);
        }
        FsCommand::Stat { path } => {
            let info = files.get_info(&path, &options).await?;
            println!("path:        {}", info.path);
            println!("type:        {:?}", info.file_type);
            println!("size:        {}", info.size);
            println!("owner:       {}:{}", info.owner, info.group);
            println!("permissions: {}", info.permissions);
            if let Some(modified) = info.modified_time {
                println!("modified:    {}", modified.to_rfc3339());
            }
        }
        FsCommand::Exists { path } => {
            println!("{}", files.exists(&path, &options).await?);
        }
        FsCommand::Mv { from, to } => files.rename(&from, &to, &options).await?,
        FsCommand::Mkdir { path } => {
            if !files.make_dir(&path, &options).await? {
                println!("{path} already exists");
            }
        }
        FsCommand::Rm { path } => files.remove(&path, &options).await?,
    }
    Ok(())
}

/// The tutorial flow: stateful code contexts, streamed commands, background
/// processes and file manipulation.
async fn demo(sandbox: Sandbox) -> Result<()> {
    println!("sandbox {} ({})", sandbox.id(), sandbox.get_host(8080));

    let code = sandbox.code();
    let stdout_sink = Callbacks::new()
        .on_stdout(|chunk| print!("[code] {}", String::from_utf8_lossy(chunk)))
        .into_sink();
    let ctx = code
        .create_code_context(CreateCodeContextConfig::new().cwd("/tmp").language("python"))
        .await?;
    code.run_code("x = 1", RunCodeConfig::new().context(&ctx), None)
        .await?;
    let exec = code
        .run_code("print(x)", RunCodeConfig::new().context(&ctx), Some(stdout_sink))
        .await?;
    println!("stateful run printed {:?}", exec.stdout().trim());
    let stateless = code
        .run_code("print(x)", RunCodeConfig::new().language("python"), None)
        .await?;
    if let Some(error) = &stateless.error {
        println!("fresh context: {}: {}", error.name, error.value);
    }
    code.remove_code_context(&ctx.id).await?;

    let commands = sandbox.commands();
    let result = commands
        .run("echo hello && ls -la /home/user", ProcessConfig::new(), Some(terminal_sink()))
        .await?;
    println!("foreground exit code {}", result.exit_code);

    let handle = commands
        .start("sleep 1 && echo done", ProcessConfig::new(), Some(terminal_sink()))
        .await?;
    println!("background pid {}", handle.pid());
    for process in commands.list(&ProcessOptions::default()).await? {
        println!("  tracked pid {} {}", process.pid, process.args.join(" "));
    }
    let finished = handle.wait().await?;
    println!("background exit code {} ({})", finished.exit_code, handle.state());

    let sleeper = commands.start("sleep 60", ProcessConfig::new(), None).await?;
    let attached = commands
        .connect(sleeper.pid(), &ProcessOptions::default(), None)
        .await?;
    attached.send_signal(ags_sandbox::SIGINT).await?;
    let interrupted = sleeper.wait().await?;
    println!("interrupted sleeper: exit {} ({})", interrupted.exit_code, sleeper.state());
    attached.disconnect().await;

    let files = sandbox.files();
    let opts = FileOptions::default();
    files.make_dir("/home/user/demo", &opts).await?;
    files.write("/home/user/demo/hello.txt", "hello", &opts).await?;
    println!(
        "read back {:?}",
        files.read_to_string("/home/user/demo/hello.txt", &opts).await?
    );
    let info = files.get_info("/home/user/demo/hello.txt", &opts).await?;
    println!("owner {} permissions {}", info.owner, info.permissions);
    files
        .rename("/home/user/demo/hello.txt", "/home/user/demo/renamed.txt", &opts)
        .await?;
    println!(
        "old exists: {}, new exists: {}",
        files.exists("/home/user/demo/hello.txt", &opts).await?,
        files.exists("/home/user/demo/renamed.txt", &opts).await?
    );
    for entry in files
        .list("/home/user", &ListDirOptions::new().depth(2))
        .await?
    {
        println!("  {}", entry.path);
    }
    files.remove("/home/user/demo", &opts).await?;

    Ok(())
}
