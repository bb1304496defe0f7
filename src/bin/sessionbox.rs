use anyhow::Result;

fn main() -> Result<()> {
    sessionbox::cli::run()
}
