//! Schema management.

use console::style;
use marketsync::db;
use marketsync::migration::{Migrator, MigratorTrait};
use tabled::{Table, Tabled};

use crate::MigrateAction;

#[derive(Tabled)]
struct MigrationRow {
    #[tabled(rename = "Migration")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
}

pub(crate) async fn handle_migrate(
    action: MigrateAction,
    database_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = db::connect(database_url).await?;

    match action {
        MigrateAction::Up => {
            let pending = Migrator::get_pending_migrations(&db).await?.len();
            if pending == 0 {
                println!("Schema is up to date.");
                return Ok(());
            }
            println!("Applying {} migration(s)...", pending);
            Migrator::up(&db, None).await?;
            println!("{}", style("Migrations applied.").green());
        }
        MigrateAction::Down => {
            println!("Rolling back the last migration...");
            Migrator::down(&db, Some(1)).await?;
            println!("{}", style("Rollback complete.").green());
        }
        MigrateAction::Status => {
            let rows: Vec<MigrationRow> = Migrator::get_migration_with_status(&db)
                .await?
                .iter()
                .map(|m| MigrationRow {
                    name: m.name().to_string(),
                    status: m.status().to_string(),
                })
                .collect();
            let mut table = Table::new(rows);
            table.with(tabled::settings::Style::rounded());
            println!("{table}");
        }
        MigrateAction::Fresh { yes } => {
            if !yes {
                return Err(
                    "`migrate fresh` drops every marketsync table, including the event queue \
                     and entity mappings. Re-run with --yes to confirm."
                        .into(),
                );
            }
            println!("Dropping all tables and reapplying migrations...");
            Migrator::fresh(&db).await?;
            println!("{}", style("Fresh schema in place.").green());
        }
    }

    Ok(())
}
