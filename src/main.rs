use anyhow::Result;

use bulls_dca::engine::DcaEngine;
use bulls_dca::exchange::bybit::BybitClient;
use bulls_dca::logging::{log, obj, v_num, v_str, Domain, Level};
use bulls_dca::state::{Config, Credentials};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let creds = match Credentials::from_env() {
        Ok(c) => c,
        Err(e) => {
            log(
                Level::Error,
                Domain::System,
                "missing_credentials",
                obj(&[("msg", v_str(&format!("{:#}", e)))]),
            );
            return Err(e);
        }
    };

    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("symbol", v_str(&cfg.symbol)),
            ("category", v_str(&cfg.category)),
            ("equity_usdt", v_num(cfg.equity_usdt)),
            ("leverage", v_num(cfg.leverage)),
            ("cross", serde_json::json!(cfg.use_cross)),
            ("total_budget", v_num(cfg.total_budget())),
        ]),
    );

    let client = BybitClient::new(&cfg, Some(creds));
    let mut engine = DcaEngine::bootstrap(cfg, client).await?;
    engine.run().await;
    Ok(())
}
