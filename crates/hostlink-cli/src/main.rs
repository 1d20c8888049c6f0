//! `hostlink-exec`: run a host command from inside the sandbox.

use hostlink_cli::{ClientConfig, ClientError, FALLBACK_EXIT_CODE, ProxyClient};

#[tokio::main]
async fn main() {
    // Silent unless RUST_LOG asks otherwise: stderr belongs to the host command.
    hostlink_core::tracing_init::init_tracing("off", false);

    let config = match ClientConfig::from_process() {
        Ok(config) => config,
        Err(ClientError::Usage(e)) => e.exit(),
        Err(e) => fail(&e),
    };

    let code = match ProxyClient::new(config).run().await {
        Ok(code) => code,
        Err(e) => fail(&e),
    };
    // Exit without dropping the runtime: a blocked stdin read would hold it open.
    std::process::exit(code);
}

#[allow(clippy::print_stderr)]
fn fail(err: &ClientError) -> ! {
    eprintln!("hostlink: {err}");
    std::process::exit(FALLBACK_EXIT_CODE);
}
