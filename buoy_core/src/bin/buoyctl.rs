use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use buoy_core::config::Config;
use buoy_database::User;

#[derive(Debug, Parser)]
#[command(name = "buoyctl", about = "administer the buoy user database")]
struct Opts {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Create a new user
    CreateUser {
        username: String,
        /// Make the new user admin
        #[arg(long)]
        admin: bool,
    },
    /// Change password for a user
    ChangePassword { username: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("buoyctl: {err}");
            ExitCode::from(1)
        }
    }
}

async fn run(opts: Opts) -> Result<(), anyhow::Error> {
    let config = match &opts.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let db = buoy_database::open(&config.sql_driver, &config.sql_source)?;

    match opts.command {
        Command::CreateUser { username, admin } => {
            let password = read_password()?;
            let hashed = bcrypt::hash(&password, bcrypt::DEFAULT_COST)?;
            let mut user = User {
                username,
                password: hashed,
                admin,
                ..Default::default()
            };
            db.store_user(&mut user).await?;
        }
        Command::ChangePassword { username } => {
            let mut user = db
                .get_user(&username)
                .await?
                .ok_or_else(|| anyhow::anyhow!("unknown user {username:?}"))?;
            let password = read_password()?;
            user.password = bcrypt::hash(&password, bcrypt::DEFAULT_COST)?;
            db.store_user(&mut user).await?;
        }
    }
    Ok(())
}

/// Prompt on a TTY, otherwise read one line from stdin
fn read_password() -> Result<String, anyhow::Error> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        print!("Password: ");
        std::io::stdout().flush()?;
    } else {
        eprintln!("Warning: reading password from stdin.");
    }

    let mut password = String::new();
    stdin.lock().read_line(&mut password)?;
    let password = password.trim_end_matches(&['\r', '\n'][..]);
    if password.is_empty() {
        anyhow::bail!("zero length password");
    }
    Ok(password.to_string())
}
