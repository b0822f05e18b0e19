use anyhow::bail;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    if !starbeam_agent::initialize() {
        bail!("starbeam agent did not start; check the STARBEAM_* environment");
    }

    tokio::signal::ctrl_c().await?;
    log::info!("starbeam: interrupt received, shutting down");
    starbeam_agent::shutdown();
    Ok(())
}
