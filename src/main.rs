use structopt::StructOpt as _;

mod cli;
mod node;
mod rpc_client;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = cli::Cli::from_args();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(node::default_config_path);

    match args.command {
        cli::Command::Node { data_dir } => {
            let config = node::load_config(&config_path)?;
            node::run(config, data_dir.as_deref()).await
        }
        cli::Command::Sweep {
            coin,
            out_pub_key,
            out_chain,
            min_input,
            max_input,
            max_total,
            max_inputs,
            min_output,
            max_output,
            max_outputs,
            broadcast,
            data_dir,
        } => {
            let config = node::load_config(&config_path)?;
            node::sweep(
                config,
                data_dir.as_deref(),
                &coin,
                &out_pub_key,
                &out_chain,
                min_input,
                max_input,
                max_total,
                max_inputs,
                min_output,
                max_output,
                max_outputs,
                broadcast,
            )
            .await
        }
        cli::Command::MasterKey { seed, show_secret } => {
            let (pub_key, chain, secret) = ferrox_crypto::masters_from_seed(&seed)?;
            println!("hotMpkPubKey: {pub_key}");
            println!("hotMpkChain:  {chain}");
            if show_secret {
                println!("master secret: {}", hex::encode(secret.as_bytes()));
            }
            Ok(())
        }
    }
}
