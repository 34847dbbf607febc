use crate::commands::{self, CommandResult};
use signoff_core::config::AppConfig;
use signoff_db::{connect_with_settings, migrations, DbPool};

pub fn run() -> CommandResult {
    let config = match commands::load_config("migrate") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match commands::current_thread_runtime("migrate") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    match runtime.block_on(apply(&config)) {
        Ok(()) => CommandResult::success(
            "migrate",
            "applied pending migrations; core approval tables are present",
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}

async fn apply(config: &AppConfig) -> Result<(), (&'static str, String, u8)> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

    let outcome = migrate_and_verify(&pool).await;
    pool.close().await;
    outcome
}

async fn migrate_and_verify(pool: &DbPool) -> Result<(), (&'static str, String, u8)> {
    migrations::run_pending(pool)
        .await
        .map_err(|error| ("migration", error.to_string(), 5u8))?;

    let schema_present = migrations::schema_present(pool)
        .await
        .map_err(|error| ("schema_check", error.to_string(), 5u8))?;
    if schema_present {
        Ok(())
    } else {
        Err((
            "schema_check",
            "migrations ran but the core approval tables are missing".to_string(),
            5u8,
        ))
    }
}
