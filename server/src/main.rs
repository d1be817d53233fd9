use server::cli::Args;

fn main() -> anyhow::Result<()> {
    logger::init();
    let args: Args = argh::from_env();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(server::run::run(args))
}
