pub fn run() -> anyhow::Result<()> {
    println!("hsj-operator {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
