mod pidfile;

use hearthvault::config::Config;
use hearthvault::logging::{LogWriter, registry_logs};
use hearthvault::server::{ServerArgs, run_until_done};
use std::sync::Arc;

fn print_banner() {
    tracing::info!("");
    tracing::info!(r#"   _                       _   _                         _  _   "#);
    tracing::info!(r#"  | |__   ___  __ _  _ __ | |_| |__ __   __ __ _  _   _ | || |_ "#);
    tracing::info!(r#"  | '_ \ / _ \/ _` || '__|| __| '_ \\ \ / // _` || | | || || __|"#);
    tracing::info!(r#"  | | | |  __/ (_| || |   | |_| | | |\ V /| (_| || |_| || || |_ "#);
    tracing::info!(r#"  |_| |_|\___|\__,_||_|    \__|_| |_| \_/  \__,_| \__,_||_| \__|"#);
    tracing::info!("");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    #[cfg(target_os = "linux")]
    let _pid = pidfile::Pidfile::new()?;
    let config = Config::from_config_file()?;
    let (mut log_writer, log_handle) = LogWriter::new()?;
    registry_logs(
        &mut log_writer,
        config.logs.level,
        config.logs.parse_dir()?,
        config.logs.enable_file_logging,
    )?;
    print_banner();
    tracing::info!(
        "hearthvault {version} starting as '{name}'",
        version = env!("CARGO_PKG_VERSION"),
        name = config.device.name,
    );
    match run_until_done(ServerArgs {
        config,
        logs: Arc::new(log_writer),
    })
    .await
    {
        Ok(()) => {
            println!("hearthvault stopping...")
        }
        Err(err) => {
            eprintln!("hearthvault has encountered an error: {}", err);
            return Err(err);
        }
    }
    match log_handle.await {
        Ok(result) => result?,
        Err(err) if err.is_panic() => {
            panic!("{}", err)
        }
        _ => (),
    };
    Ok(())
}
