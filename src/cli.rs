// Operator CLI for Open Testimony.

use clap::{Parser, Subcommand};

use open_testimony::audit;
use open_testimony::auth::hash_password;
use open_testimony::config::Settings;
use open_testimony::db::{migrations, open_db, schema};
use open_testimony::index::clusters;

#[derive(Parser)]
#[command(name = "otadmin")]
#[command(about = "Open Testimony operator tools", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Verify the full audit chain
    VerifyChain,

    /// Create or reset an admin user
    SeedAdmin {
        username: String,
        password: String,
        /// Display name (defaults to the username)
        #[arg(long)]
        display_name: Option<String>,
    },

    /// Run a full HDBSCAN re-cluster over all face embeddings
    ReclusterFaces,

    /// Show indexing queue counts by status
    Jobs,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    let mut conn = open_db(&settings.database_path)?;

    match cli.command {
        Commands::Migrate => {
            // open_db already ran migrations; make the dimension check explicit too
            migrations::ensure_embedding_dims(
                &conn,
                &migrations::embedding_tables(
                    settings.vision_embedding_dim,
                    settings.transcript_embedding_dim,
                ),
            )?;
            println!("Migrations applied");
        }

        Commands::VerifyChain => {
            let result = audit::verify_chain(&conn)?;
            println!(
                "valid: {}  entries_checked: {}",
                result.valid, result.entries_checked
            );
            for error in &result.errors {
                println!(
                    "  seq {}: {} (expected {}, actual {})",
                    error.sequence_number, error.error, error.expected, error.actual
                );
            }
            if !result.valid {
                std::process::exit(1);
            }
        }

        Commands::SeedAdmin {
            username,
            password,
            display_name,
        } => {
            let hash = hash_password(&password)?;
            let display = display_name.unwrap_or_else(|| username.clone());
            match schema::get_user_by_username(&conn, &username)? {
                Some(user) => {
                    schema::set_user_password(&conn, &user.id, &hash)?;
                    schema::update_user_fields(&conn, &user.id, None, Some("admin"), Some(true))?;
                    println!("Updated existing user '{}' as admin", username);
                }
                None => {
                    schema::insert_user(&conn, &username, &hash, &display, "admin")?;
                    println!("Created admin user '{}'", username);
                }
            }
            audit::log_event(
                &mut conn,
                "user_created",
                serde_json::json!({ "username": username, "role": "admin", "via": "cli" }),
                audit::EventRefs::default(),
            )?;
        }

        Commands::ReclusterFaces => {
            let (num_clusters, num_noise) =
                clusters::run_full_clustering(&conn, settings.face_cluster_min_size)?;
            println!("clusters: {}  noise: {}", num_clusters, num_noise);
        }

        Commands::Jobs => {
            let counts = schema::job_status_counts(&conn)?;
            if counts.is_empty() {
                println!("No indexing jobs");
            }
            for (status, count) in counts {
                println!("{:>16}  {}", status, count);
            }
        }
    }

    Ok(())
}
