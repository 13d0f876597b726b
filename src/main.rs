//! bookstore-rs server entry point.

use bookstore_rs::{
    auth::AuthService,
    config::{Cli, Command, Config, UserCommand},
    db::{Database, User, now_timestamp},
    server,
};
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force).await,
        Some(Command::User { action }) => cmd_user(action, &config).await,
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => {
            // Default: start server
            cmd_serve(config, None).await
        }
    }
}

/// Initialize config and database.
async fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    let config = Config::default();
    let _db = Database::open(&config.database.path)?;
    println!("Initialized database: {}", config.database.path.display());

    println!("\nEdit config.toml to configure your store.");
    println!("Then run: bookstore-rs user add <email> --password <password> --role admin");

    Ok(())
}

/// User management commands.
async fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;

    match action {
        UserCommand::Add {
            email,
            name,
            password,
            role,
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("Password: ")?,
            };

            let email = email.trim().to_lowercase();
            let now = now_timestamp();
            let user = User {
                id: uuid::Uuid::new_v4().to_string(),
                email: email.clone(),
                name,
                password_hash: AuthService::hash_password(&password)?,
                role,
                is_active: true,
                created_at: now,
                updated_at: now,
                last_login: None,
            };
            db.create_user(&user)?;
            println!("Created user: {} (role: {}, id: {})", email, user.role, user.id);
        }

        UserCommand::Deactivate { email } => {
            let email = email.trim().to_lowercase();
            match db.get_user_by_email(&email)? {
                Some(user) => {
                    db.set_user_active(&user.id, false)?;
                    println!("Deactivated user: {}", email);
                }
                None => println!("User not found: {}", email),
            }
        }

        UserCommand::List => {
            let users = db.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<30} {:<10} {:<36} ACTIVE", "EMAIL", "ROLE", "ID");
                println!("{}", "-".repeat(84));
                for user in users {
                    println!(
                        "{:<30} {:<10} {:<36} {}",
                        user.email,
                        user.role,
                        user.id,
                        if user.is_active { "yes" } else { "no" }
                    );
                }
            }
        }

        UserCommand::Passwd { email, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("New password: ")?,
            };

            let email = email.trim().to_lowercase();
            let hash = AuthService::hash_password(&password)?;
            if db.update_user_password(&email, &hash)? {
                println!("Password changed for: {}", email);
            } else {
                println!("User not found: {}", email);
            }
        }
    }

    Ok(())
}

/// Start the server.
async fn cmd_serve(config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bookstore_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        bind = %bind.unwrap_or(config.server.bind),
        database = %config.database.path.display(),
        title = %config.server.title,
        "Starting bookstore-rs server"
    );

    server::run(config, bind).await?;
    Ok(())
}

fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;

    Ok(password.trim().to_string())
}
