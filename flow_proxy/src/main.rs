#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use flow_proxy::{
    config::Config,
    inbound,
    outbound::{ChainOutbound, Outbound},
    utils::{Resolver, SystemResolver},
};

use std::rc::Rc;

type Error = Box<dyn std::error::Error + Sync + Send>;

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load("./config.json5")?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async {
        let resolver: Rc<dyn Resolver> = Rc::new(SystemResolver);
        let outbound: Rc<dyn Outbound> = Rc::new(ChainOutbound::new(&config, resolver)?);
        log::info!("server started with {} route(s)", config.routes.len().max(1));
        inbound::start(&config, outbound).await?;
        Ok::<(), Error>(())
    })
}
