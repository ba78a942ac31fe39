use anyhow::Result;

fn main() -> Result<()> {
    let code = isolate::cli::run()?;
    std::process::exit(code);
}
