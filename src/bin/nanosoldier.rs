use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;

use nanosoldier::{
    api::GithubApi,
    config::{ServerConfig, ron_to_string_pretty},
    logging::{LogLevel, set_log_level},
    server::Server,
};

/// Hosting-service CI bot: benchmark and package-evaluation jobs on
/// demand, triggered from comments.
#[derive(clap::Parser, Debug)]
#[clap(next_line_help = true)]
struct Opts {
    /// How much to log to stderr
    #[clap(long, value_enum, default_value = "warn")]
    log_level: LogLevel,

    /// Path to the RON config file
    #[clap(long, default_value = "nanosoldier.ron")]
    config: PathBuf,

    /// The subcommand to run. Use `--help` after the sub-command to
    /// get the options there.
    #[clap(subcommand)]
    subcommand: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Run the webhook server and the per-node dispatcher loops.
    Serve {
        /// The address to bind
        #[clap(long, default_value = "0.0.0.0")]
        bind: String,

        /// TCP port for the webhook endpoint
        #[clap(long, default_value_t = 8000)]
        port: u16,
    },

    /// Post the scheduled daily trigger comments onto the head of the
    /// tracked repository's default branch; meant to be driven by
    /// cron. The jobs then arrive through the webhook like any other
    /// submission.
    Daily,

    /// Parse the config file and print it back, to verify it.
    PrintConfig,
}

fn main() -> Result<()> {
    let Opts {
        log_level,
        config,
        subcommand,
    } = Opts::parse();
    set_log_level(log_level);
    let config = ServerConfig::load(&config)?;

    match subcommand {
        SubCommand::Serve { bind, port } => {
            let server = Server::new(config)?;
            tokio::runtime::Runtime::new()?.block_on(server.run(&bind, port))
        }
        SubCommand::Daily => tokio::runtime::Runtime::new()?.block_on(run_daily(config)),
        SubCommand::PrintConfig => {
            println!("{}", ron_to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_daily(config: ServerConfig) -> Result<()> {
    let api = GithubApi::new(config.auth_token()?)?;
    let sha = api
        .branch_head(&config.track_repo, &config.track_branch)
        .await
        .with_context(|| {
            anyhow!(
                "resolving the head of {}:{}",
                config.track_repo,
                config.track_branch
            )
        })?;
    for phrase in [
        "runbenchmarks(ALL, isdaily = true)",
        "runtests(ALL, isdaily = true)",
    ] {
        let body = format!("@{} `{phrase}`", config.user);
        api.add_commit_comment(&config.track_repo, &sha, &body)
            .await
            .with_context(|| anyhow!("posting the daily trigger {phrase:?}"))?;
    }
    Ok(())
}
