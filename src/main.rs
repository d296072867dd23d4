use std::sync::{Arc, Mutex};

use civiclab::capability::CapabilitySet;
use civiclab::logging::{json_log, obj, v_str};
use civiclab::server::{self, App};
use civiclab::state::Config;
use civiclab::storage::Store;
use civiclab::tick::HttpVerifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env();
    let mut store = Store::open(&cfg.sqlite_path)?;
    store.init()?;
    let capabilities = CapabilitySet::from_config(&cfg)?;
    let verifier = HttpVerifier::new(&cfg)?;

    json_log(
        "startup",
        obj(&[
            ("db", v_str(&cfg.sqlite_path)),
            ("addr", v_str(&cfg.http_addr)),
            ("environment", v_str(&cfg.environment)),
        ]),
    );

    let app = Arc::new(App {
        cfg,
        store: Mutex::new(store),
        capabilities,
        verifier: Box::new(verifier),
    });
    server::serve(app).await
}
