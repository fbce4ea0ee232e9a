use anyhow::Result;

fn main() -> Result<()> {
    modsync::cli::run()
}
