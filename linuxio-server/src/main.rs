#[macro_use]
extern crate tracing;

use std::sync::Arc;

use camino::Utf8PathBuf;
use linuxio_server::auth::CredentialVerifier;
use linuxio_server::config::{Conf, ConfHandle};
use linuxio_server::{service, LogConfig};

fn print_usage_and_exit() -> ! {
    eprintln!("usage: linuxio-server run [-port N] [-verbose]");
    std::process::exit(2)
}

fn parse_args(args: &[String]) -> (Option<u16>, bool) {
    let mut port = None;
    let mut verbose = false;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-port" => {
                let value = iter.next().unwrap_or_else(|| print_usage_and_exit());
                let parsed: u16 = value.parse().unwrap_or_else(|_| print_usage_and_exit());
                if parsed == 0 {
                    print_usage_and_exit();
                }
                port = Some(parsed);
            }
            "-verbose" => verbose = true,
            _ => print_usage_and_exit(),
        }
    }

    (port, verbose)
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(subcommand) = args.next() else {
        print_usage_and_exit();
    };
    if subcommand != "run" {
        print_usage_and_exit();
    }

    let rest: Vec<String> = args.collect();
    let (port, verbose) = parse_args(&rest);

    let conf = Conf::from_cli(port, verbose)?;
    let conf = ConfHandle::new(conf);

    let log_directive = if conf.get().verbose {
        "debug".to_owned()
    } else {
        conf.get().log_directive.clone()
    };
    let _logger_guard = bridge_log::init::<LogConfig>(&Utf8PathBuf::from(&conf.get().log_file), &log_directive, None)?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(async move {
        let credential_verifier: Arc<dyn CredentialVerifier> = default_credential_verifier();
        let tasks = service::spawn_tasks(conf, credential_verifier).await?;

        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");
        tasks.stop();
        tasks.join_all().await;

        anyhow::Ok(())
    })
}

#[cfg(unix)]
fn default_credential_verifier() -> Arc<dyn CredentialVerifier> {
    Arc::new(linuxio_server::auth::PamVerifier {
        service: "linuxio".to_owned(),
    })
}

#[cfg(not(unix))]
fn default_credential_verifier() -> Arc<dyn CredentialVerifier> {
    Arc::new(linuxio_server::auth::StaticVerifier {
        username: "admin".to_owned(),
        password: "admin".to_owned(),
    })
}
