fn main() -> anyhow::Result<()> {
    medscan_core::run()
}
