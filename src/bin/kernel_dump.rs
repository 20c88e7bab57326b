use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use clap::Parser;
use gravtree::kernel::{ShortRangeTable, softened_pair};

/// Writes the force kernels as CSV for plotting.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Buckets in the short-range table.
    #[arg(long, default_value_t = gravtree::kernel::NTAB)]
    buckets: usize,
    /// Softening length for the spline columns.
    #[arg(long, default_value_t = 1.0)]
    softening: f64,
    /// Output file, stdout when absent.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// One row per bucket: `u,force,potential,tidal,spline_force,spline_potential`.
///
/// The spline columns are evaluated at `r = u * softening` for unit mass, so
/// they can be compared with Newton beyond the softening length.
fn dump(out: &mut impl Write, buckets: usize, softening: f64) -> io::Result<()> {
    let table = ShortRangeTable::new(buckets);
    writeln!(out, "u,force,potential,tidal,spline_force,spline_potential")?;
    for i in 0..table.len() {
        let u = 3.0 / buckets as f64 * (i as f64 + 0.5);
        let spline = softened_pair(1.0, u * softening, softening);
        writeln!(
            out,
            "{u},{},{},{},{},{}",
            table.force_factor(i),
            table.potential_factor(i),
            table.tidal_factor(i),
            spline.force,
            spline.potential
        )?;
    }
    out.flush()
}

fn main() -> io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    match &args.output {
        Some(path) => dump(&mut BufWriter::new(File::create(path)?), args.buckets, args.softening),
        None => dump(&mut io::stdout().lock(), args.buckets, args.softening),
    }
}
