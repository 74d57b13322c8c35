use std::io::Read;

use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use scribe_lib::runtime::ScribeRuntime;

#[derive(Parser)]
#[command(name = "scribe")]
#[command(about = "Structure medical dictation into validated consultations", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Structure a dictation and save it as a draft
    Analyze {
        /// Patient identifier (generated when absent)
        #[arg(long)]
        patient: Option<String>,
        /// Skip the result cache
        #[arg(long)]
        no_cache: bool,
        /// Dictation text (read from stdin when absent)
        text: Option<String>,
    },
    /// Merge a partial JSON document into a draft
    Update {
        /// Draft UUID
        id: Uuid,
        /// Partial consultation as JSON
        partial: String,
        /// Version the edit was based on
        #[arg(long)]
        version: Option<i64>,
    },
    /// Promote a draft to VALIDATED
    Validate {
        /// Draft UUID
        id: Uuid,
    },
    /// Probe the relational, graph and coordination stores
    Health,
    /// Draft, graph, queue and counter totals
    Stats,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    scribe_lib::init_tracing();
    let cli = Cli::parse();
    let runtime = ScribeRuntime::from_env()?;
    let structurer = runtime.structurer();

    match cli.command {
        Commands::Analyze {
            patient,
            no_cache,
            text,
        } => {
            let text = match text {
                Some(text) => text,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let result = if no_cache {
                structurer.analyze(&text, patient.as_deref())?
            } else {
                structurer.analyze_consultation(&text, patient.as_deref())?
            };
            print_json(&result)?;
        }
        Commands::Update {
            id,
            partial,
            version,
        } => {
            let partial: serde_json::Value = serde_json::from_str(&partial)?;
            print_json(&structurer.update_draft(&id, &partial, version)?)?;
        }
        Commands::Validate { id } => {
            print_json(&structurer.validate_draft(&id)?)?;
        }
        Commands::Health => {
            print_json(&runtime.check_health())?;
        }
        Commands::Stats => {
            print_json(&runtime.stats()?)?;
        }
    }

    Ok(())
}
