pub fn run() -> anyhow::Result<()> {
    println!("ip-address-controller {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
