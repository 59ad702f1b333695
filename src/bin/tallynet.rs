use clap::{crate_version, Parser};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use tallynet::config::Settings;
use tallynet::error::Error;
use tallynet::network::Network;
use tallynet::node::{FixedResponse, ResponsePolicy};

#[derive(Debug, Parser)]
#[command(name = "tallynet")]
#[command(version = crate_version!())]
#[command(
    about = "tallynet - private map, secure reduce",
    long_about = "Tallynet runs a local privacy-preserving aggregation network. Contributor nodes hold private numeric values and never reveal them; each value is split into three additive shares modulo 2^32 and spread over three coordinator nodes, which can only ever reconstruct the aggregate sum. Use `demo` to spin up a network, run one computation end to end and print the aggregate."
)]
enum CliArgument {
    /// Start an ephemeral network, run one computation and print the result.
    Demo {
        /// Number of contributor nodes to spawn.
        #[clap(long, short, default_value_t = 5)]
        contributors: usize,

        /// The question put to the contributors.
        #[clap(long, short, default_value = "How many incidents did you observe last month?")]
        prompt: String,

        /// Collection deadline in seconds.
        #[clap(long, short, default_value_t = 5)]
        deadline: u64,

        /// Minimum number of aligned participants for a result.
        #[clap(long, short, default_value_t = 1)]
        min_participants: usize,

        /// Fixed contributor values instead of the uniform policy,
        /// e.g. --values 11,20,72 (spawns one contributor per value).
        #[clap(long, value_delimiter = ',')]
        values: Option<Vec<u64>>,
    },
    /// Start an ephemeral network and print its node table.
    Status {
        /// Number of contributor nodes to spawn.
        #[clap(long, short, default_value_t = 5)]
        contributors: usize,
    },
}

#[derive(Parser, Debug)]
#[clap(name = "tallynet")]
struct Opt {
    /// Home directory for durable stores; in-memory when omitted.
    #[clap(long)]
    home: Option<String>,

    #[clap(subcommand)]
    argument: CliArgument,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let opt = Opt::parse();
    let settings = match &opt.home {
        Some(home) => Settings::load(home).map_err(|e| Error::Fatal(e.to_string()))?,
        None => Settings::ephemeral(),
    };

    match opt.argument {
        CliArgument::Demo {
            contributors,
            prompt,
            deadline,
            min_participants,
            values,
        } => {
            let mut network = Network::new(settings).await?;
            match values {
                Some(values) => {
                    network.start_network(3, 0).await?;
                    for value in values {
                        let policy: Arc<dyn ResponsePolicy> = Arc::new(FixedResponse(value));
                        network.add_contributor_with_policy(Some(policy)).await?;
                    }
                }
                None => {
                    network.start_network(3, contributors).await?;
                }
            }

            let comp_id = network
                .propose_computation(&prompt, deadline, min_participants)
                .await?;
            println!("🗳️  proposed computation {comp_id}");
            println!("    prompt: {prompt:?}");
            println!("    deadline: {deadline}s, min participants: {min_participants}");

            let wait = Duration::from_secs(deadline + 30);
            let outcome = network.await_result(&comp_id, wait).await;
            match outcome {
                Ok(record) => {
                    println!("✅ computation {comp_id} completed");
                    println!("    sum: {}", record.result.unwrap_or_default());
                    if let Some(mean) = record.mean() {
                        println!("    mean: {mean:.2}");
                    }
                    println!(
                        "    participants: {}",
                        record.participants_count.unwrap_or_default()
                    );
                }
                Err(e) => println!("❌ computation {comp_id} did not complete: {e}"),
            }

            network.shutdown().await?;
        }
        CliArgument::Status { contributors } => {
            let mut network = Network::new(settings).await?;
            network.start_network(3, contributors).await?;

            let status = network.network_status()?;
            println!(
                "📊 {} nodes ({} coordinators, {} contributors)",
                status.nodes.len(),
                status.coordinator_count,
                status.contributor_count
            );
            for node in &status.nodes {
                println!("    {} {} {} [{}]", node.id, node.role, node.endpoint, node.status);
            }

            network.shutdown().await?;
        }
    }

    Ok(())
}
