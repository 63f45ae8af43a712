use super::CliContext;

pub fn execute(context: &CliContext) -> anyhow::Result<i32> {
    let sarge = context.open()?;
    sarge.init()?;
    println!(
        "sarge home initialised at {}. Point supervisord at {}",
        context.home.display(),
        sarge.supervisor().config_path().display()
    );
    Ok(0)
}
