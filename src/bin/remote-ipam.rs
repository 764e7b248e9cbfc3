//! IPAM plugin that delegates to a remote `remote-ipamd`.

use std::env;
use std::io::Read;
use std::process::ExitCode;

use log::error;

use remote_ipam::client::Delegator;
use remote_ipam::plugin::{self, PluginError, ENV_COMMAND, ENV_CONTAINER_ID};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Logs go to stderr, stdout is reserved for the result.
    env_logger::init();

    let mut stdin = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut stdin) {
        error!("Failed to read network configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let outcome = match env::var(ENV_COMMAND) {
        Ok(command) => match Delegator::new() {
            Ok(delegator) => {
                let container_id = env::var(ENV_CONTAINER_ID).ok();
                plugin::run(&command, container_id.as_deref(), &stdin, &delegator).await
            }
            Err(e) => Err(e.into()),
        },
        Err(_) => Err(PluginError::MissingEnv(ENV_COMMAND)),
    };

    match outcome {
        Ok(Some(output)) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            println!("{}", plugin::error_output(&e, &stdin));
            ExitCode::FAILURE
        }
    }
}
