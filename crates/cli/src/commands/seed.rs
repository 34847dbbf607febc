use crate::commands::{self, CommandResult};
use signoff_db::{connect_with_settings, migrations, SeedDataset, SeedFlowInfo};

pub fn run() -> CommandResult {
    let config = match commands::load_config("seed") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match commands::current_thread_runtime("seed") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let seed_result = SeedDataset::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;

        let verification = SeedDataset::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        let run_result: Result<Vec<SeedFlowInfo>, (&'static str, String, u8)> =
            if verification.all_present {
                Ok(seed_result.flows)
            } else {
                let failed_checks = verification
                    .checks
                    .iter()
                    .filter_map(|(check, passed)| (!passed).then_some(*check))
                    .collect::<Vec<_>>();
                let message = if failed_checks.is_empty() {
                    "seed data failed to load".to_string()
                } else {
                    format!("seed verification failed for checks: {}", failed_checks.join(", "))
                };
                Err(("seed_verification", message, 6u8))
            };

        pool.close().await;
        run_result
    });

    match result {
        Ok(flows) => {
            let flow_descriptions: Vec<String> = flows
                .iter()
                .map(|flow| format!("  - {}: {}", flow.slug, flow.description))
                .collect();
            let message = format!(
                "seed dataset loaded and verified:\n{}",
                flow_descriptions.join("\n")
            );
            CommandResult::success("seed", message)
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}
