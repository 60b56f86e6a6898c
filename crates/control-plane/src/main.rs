#[tokio::main]
async fn main() -> fleet_hub::Result<()> {
    fleet_hub::init_tracing();
    let mode = fleet_hub::parse_command()?;
    tracing::info!(
        version = fleet_hub::version::VERSION,
        git_sha = fleet_hub::version::GIT_SHA,
        dirty = fleet_hub::version::GIT_DIRTY,
        built_at = fleet_hub::version::BUILD_TIMESTAMP,
        mode = ?mode,
        "fleet hub starting"
    );
    fleet_hub::run(mode).await
}
