use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password, Select};
use std::path::PathBuf;
use std::sync::Arc;

use health_session::config::{Config, SettingsArgs};
use health_session::session::{SignupRequest, UserRole};
use health_session::{SessionError, SessionEvent, SessionManager, UploadPart};

/// Health Session - authenticated client for the health records API
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and persist the session
    Login {
        email: String,
        /// Prompted for when omitted
        #[arg(long, env = "HEALTH_PASSWORD")]
        password: Option<String>,
    },

    /// Create an account (prompts for anything not given)
    Signup {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },

    /// Forget the stored session
    Logout,

    /// Show who is logged in
    Status,

    /// GET a path
    Get { path: String },

    /// POST a JSON body to a path
    Post { path: String, body: String },

    /// PATCH a JSON body to a path
    Patch { path: String, body: String },

    /// DELETE a path
    Delete { path: String },

    /// Upload a file as multipart form data
    Upload {
        path: String,
        file: PathBuf,
        #[arg(long, default_value = "file")]
        field: String,
        #[arg(long)]
        mime: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before parsing so env fallbacks see it
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::from_args(cli.settings)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("API base URL: {}", config.api_base_url);

    let session = Arc::new(SessionManager::new(&config)?);

    session
        .subscribe(|event| match event {
            SessionEvent::LoggedIn { user } => {
                tracing::info!("Logged in as {}", user.name.as_deref().unwrap_or("unknown"))
            }
            SessionEvent::Refreshed => tracing::info!("Session refreshed"),
            SessionEvent::LoggedOut => tracing::info!("Session ended"),
            SessionEvent::Expired { reason } => {
                tracing::warn!("Session expired ({}), please log in again", reason)
            }
        })
        .detach();

    match run(&session, cli.command).await {
        Err(e) if e.requires_login() => {
            eprintln!("Session expired. Run `health-session login <email>` to sign in again.");
            std::process::exit(2);
        }
        result => result.context("Command failed"),
    }
}

async fn run(session: &SessionManager, command: Command) -> Result<(), SessionError> {
    let api = session.api();

    let response = match command {
        Command::Login { email, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password()?,
            };
            let user = session.login(&email, &password).await?;
            print_user(&user);
            return Ok(());
        }
        Command::Signup {
            name,
            email,
            role,
            phone,
        } => {
            let request = signup_request(name, email, role, phone)?;
            let user = session.signup(&request).await?;
            print_user(&user);
            return Ok(());
        }
        Command::Logout => {
            session.logout();
            println!("Logged out");
            return Ok(());
        }
        Command::Status => {
            match session.current_user() {
                Some(user) if session.is_authenticated() => print_user(&user),
                _ => println!("Not logged in"),
            }
            return Ok(());
        }
        Command::Get { path } => api.get(&path).await?,
        Command::Post { path, body } => api.post(&path, &parse_body(&body)?).await?,
        Command::Patch { path, body } => api.patch(&path, &parse_body(&body)?).await?,
        Command::Delete { path } => api.delete(&path).await?,
        Command::Upload {
            path,
            file,
            field,
            mime,
        } => {
            let part = UploadPart::from_path(field, &file, mime.as_deref()).await?;
            api.upload(&path, vec![part]).await?
        }
    };

    let status = response.status();
    let text = response.text().await?;
    println!("HTTP {}", status);
    let parsed = serde_json::from_str::<serde_json::Value>(&text);
    match parsed {
        Ok(json) => println!(
            "{}",
            serde_json::to_string_pretty(&json).unwrap_or(text)
        ),
        Err(_) => println!("{}", text),
    }

    Ok(())
}

fn parse_body(body: &str) -> Result<serde_json::Value, SessionError> {
    serde_json::from_str(body)
        .map_err(|e| SessionError::InvalidRequest(format!("body is not valid JSON: {}", e)))
}

fn prompt_password() -> Result<String, SessionError> {
    Password::new()
        .with_prompt("Password")
        .interact()
        .map_err(|e| SessionError::InvalidRequest(format!("failed to read password: {}", e)))
}

fn signup_request(
    name: Option<String>,
    email: Option<String>,
    role: Option<String>,
    phone: Option<String>,
) -> Result<SignupRequest, SessionError> {
    let prompt_err =
        |e: dialoguer::Error| SessionError::InvalidRequest(format!("failed to read input: {}", e));

    let name = match name {
        Some(n) => n,
        None => Input::<String>::new()
            .with_prompt("Full name")
            .interact_text()
            .map_err(prompt_err)?,
    };
    let email = match email {
        Some(e) => e,
        None => Input::<String>::new()
            .with_prompt("Email")
            .interact_text()
            .map_err(prompt_err)?,
    };
    let role = match role {
        Some(r) => r.parse::<UserRole>().map_err(SessionError::InvalidRequest)?,
        None => {
            let roles = [UserRole::Patient, UserRole::Doctor, UserRole::Admin];
            let labels: Vec<&str> = roles.iter().map(|r| r.as_str()).collect();
            let idx = Select::new()
                .with_prompt("Role")
                .items(&labels)
                .default(0)
                .interact()
                .map_err(prompt_err)?;
            roles[idx]
        }
    };
    let password = Password::new()
        .with_prompt("Password")
        .with_confirmation("Repeat password", "Passwords do not match")
        .interact()
        .map_err(prompt_err)?;

    Ok(SignupRequest {
        name,
        email,
        password,
        role,
        phone,
        date_of_birth: None,
        gender: None,
    })
}

fn print_user(user: &health_session::session::UserProfile) {
    println!("Name:  {}", user.name.as_deref().unwrap_or("-"));
    println!("Email: {}", user.email.as_deref().unwrap_or("-"));
    println!("Role:  {}", user.role.as_deref().unwrap_or("-"));
}
