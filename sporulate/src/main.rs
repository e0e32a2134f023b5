use clap::Parser;
use color_eyre::{eyre::WrapErr, Help};
use sporulate::{
    term::{style, OwoColorize},
    Options, Result,
};

fn main() -> Result<()> {
    color_eyre::install()?;

    let opts = Options::parse();
    opts.output.init()?;

    tracing::debug!(
        opts.producers,
        opts.consumers,
        ?opts.duration,
        opts.items,
        ?opts.reclaim_threshold,
        "sporulate configuration"
    );

    let report = opts
        .soak()
        .run()
        .wrap_err("the queue did not survive the soak")
        .note("rerun with `RUST_LOG=sporulate=debug` to see what each thread was doing")?;

    let done = if opts.output.color.should_color_stdout() {
        style().green().bold()
    } else {
        style()
    };
    println!("{:>12} {report}", "Finished".style(done));
    Ok(())
}
