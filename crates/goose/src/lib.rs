//! Thin wrapper around the `goose` CLI used to apply the SQL schema at startup.

use anyhow::{bail, Context, Result};
use std::fmt;
use tokio::process::Command;
use tracing::{debug, info};

/// Driver name goose expects for PostgreSQL
pub const POSTGRES_DRIVER: &str = "postgres";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GooseCommand {
    Up,
    Down,
    Status,
}

impl fmt::Display for GooseCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GooseCommand::Up => "up",
            GooseCommand::Down => "down",
            GooseCommand::Status => "status",
        };
        f.write_str(name)
    }
}

/// Runs goose migrations by spawning the goose binary.
pub struct MigrationRunner {
    goose_binary_path: String,
    migrations_dir: String,
    driver: String,
    dsn: String,
}

impl MigrationRunner {
    pub fn new(
        goose_binary_path: String,
        migrations_dir: String,
        driver: String,
        dsn: String,
    ) -> Self {
        Self {
            goose_binary_path,
            migrations_dir,
            driver,
            dsn,
        }
    }

    /// Runner for a PostgreSQL DSN
    pub fn postgres(goose_binary_path: String, migrations_dir: String, dsn: String) -> Self {
        Self::new(
            goose_binary_path,
            migrations_dir,
            POSTGRES_DRIVER.to_string(),
            dsn,
        )
    }

    /// Apply every pending migration
    pub async fn run_migrations(&self) -> Result<()> {
        let stdout = self.invoke(GooseCommand::Up).await?;
        info!(migrations_dir = %self.migrations_dir, "migrations applied");
        debug!("goose up output:\n{}", stdout);
        Ok(())
    }

    /// Roll back the most recent migration
    pub async fn rollback_migration(&self) -> Result<()> {
        let stdout = self.invoke(GooseCommand::Down).await?;
        debug!("goose down output:\n{}", stdout);
        Ok(())
    }

    /// Human readable migration status as printed by goose
    pub async fn migration_status(&self) -> Result<String> {
        self.invoke(GooseCommand::Status).await
    }

    fn args(&self, command: GooseCommand) -> Vec<String> {
        vec![
            "-dir".to_string(),
            self.migrations_dir.clone(),
            self.driver.clone(),
            self.dsn.clone(),
            command.to_string(),
        ]
    }

    async fn invoke(&self, command: GooseCommand) -> Result<String> {
        debug!(%command, migrations_dir = %self.migrations_dir, "invoking goose");

        let output = Command::new(&self.goose_binary_path)
            .args(self.args(command))
            .output()
            .await
            .with_context(|| format!("failed to spawn '{}'", self.goose_binary_path))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "goose {} failed.\nstdout: {}\nstderr: {}",
                command,
                stdout,
                stderr
            );
        }

        Ok(stdout)
    }
}
