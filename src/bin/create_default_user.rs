use anyhow::{Context, Result};
use clap::Parser;
use clap::builder::BoolishValueParser;
use routedb::{
    Engines, Operation, PostgresDriver, SessionRegistry, Settings, Value, standalone_session,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "create-default-user")]
#[command(about = "Create the default application user unless it already exists")]
struct Cli {
    #[arg(long, env = "DEFAULT_USER_USERNAME")]
    username: String,

    #[arg(long, env = "DEFAULT_USER_EMAIL")]
    email: String,

    #[arg(long, env = "DEFAULT_USER_PASSWORD", hide_env_values = true)]
    password: String,

    #[arg(
        long,
        env = "DEFAULT_USER_IS_ADMIN",
        default_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    is_admin: bool,
}

enum Outcome {
    Created,
    Exists { field: &'static str, value: String },
}

/// Users table access through the session of the current unit of work.
struct UserRepository<'a> {
    registry: &'a SessionRegistry,
}

impl<'a> UserRepository<'a> {
    fn new(registry: &'a SessionRegistry) -> Self {
        Self { registry }
    }

    async fn find_id_by(&self, column: &'static str, value: &str) -> routedb::Result<Option<i64>> {
        let result = self
            .registry
            .current()?
            .execute(
                Operation::new(format!("SELECT id FROM users WHERE {} = $1 LIMIT 1", column))
                    .bind(value),
            )
            .await?;
        Ok(result.first_value("id").and_then(Value::as_i64))
    }

    async fn create(&self, username: &str, email: &str, password_hash: &str, is_admin: bool) -> routedb::Result<()> {
        self.registry.current()?.add(
            Operation::new(
                "INSERT INTO users (username, email, password, is_admin) VALUES ($1, $2, $3, $4)",
            )
            .bind(username)
            .bind(email)
            .bind(password_hash)
            .bind(is_admin),
        )
        .await
    }
}

async fn create_default_user(registry: &SessionRegistry, cli: &Cli) -> Result<Outcome> {
    let users = UserRepository::new(registry);

    if users.find_id_by("email", &cli.email).await?.is_some() {
        return Ok(Outcome::Exists {
            field: "email",
            value: cli.email.clone(),
        });
    }
    if users.find_id_by("username", &cli.username).await?.is_some() {
        return Ok(Outcome::Exists {
            field: "username",
            value: cli.username.clone(),
        });
    }

    let password_hash =
        bcrypt::hash(&cli.password, bcrypt::DEFAULT_COST).context("hashing password")?;
    users
        .create(&cli.username, &cli.email, &password_hash, cli.is_admin)
        .await?;

    Ok(Outcome::Created)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let settings = Settings::from_env().context("reading database settings")?;
    let config = settings.database_config()?;
    info!(
        environment = %settings.environment,
        writer = %config.writer.to_url(),
        "connecting"
    );

    let engines = Arc::new(Engines::from_config(&config, Arc::new(PostgresDriver::new()))?);
    let registry = SessionRegistry::new(Arc::clone(&engines));

    let outcome = standalone_session(&registry, |_session| create_default_user(&registry, &cli)).await;
    engines.dispose().await?;

    match outcome? {
        Outcome::Exists { field, value } => {
            println!("Default user already exists ({}): {}", field, value);
        }
        Outcome::Created => {
            println!("Default user created");
            println!("  Username: {}", cli.username);
            println!("  Email:    {}", cli.email);
            println!("  Admin:    {}", if cli.is_admin { "yes" } else { "no" });
        }
    }

    Ok(())
}
