use std::io;

use graphcheck::harness::{Harness, HarnessConfig};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let harness = Harness::new(HarnessConfig::default());

    harness.run(&mut io::stdout().lock())?;

    Ok(())
}
