use anyhow::Result;

fn main() -> Result<()> {
    mazebox::cli::run()
}
