use core::time::Duration;
use std::io::{self, Write};

use crate::{cfg::OutputFormat, reporter::Report};

/// Maximum width of a histogram bar.
const BAR_WIDTH: u64 = 40;

/// Writes the report in the given format.
pub fn print<W>(wr: &mut W, report: &Report, format: OutputFormat) -> Result<(), io::Error>
where
    W: Write,
{
    match format {
        OutputFormat::Summary => print_summary(wr, report)?,
        OutputFormat::Json => serde_json::to_writer(&mut *wr, report).map_err(io::Error::from)?,
        OutputFormat::Pretty => serde_json::to_writer_pretty(&mut *wr, report).map_err(io::Error::from)?,
    }
    if format != OutputFormat::Summary {
        writeln!(wr)?;
    }

    wr.flush()
}

#[inline]
fn ms(d: Duration) -> String {
    format!("{:.2} ms", d.as_secs_f64() * 1e3)
}

fn print_summary<W>(wr: &mut W, report: &Report) -> Result<(), io::Error>
where
    W: Write,
{
    writeln!(wr)?;
    writeln!(wr, "Summary:")?;
    if let Some(name) = &report.name {
        writeln!(wr, "  Name:\t\t{name}")?;
    }
    writeln!(wr, "  Count:\t{}", report.count)?;
    writeln!(wr, "  Total:\t{}", ms(report.total))?;
    writeln!(wr, "  Slowest:\t{}", ms(report.slowest))?;
    writeln!(wr, "  Fastest:\t{}", ms(report.fastest))?;
    writeln!(wr, "  Average:\t{}", ms(report.average))?;
    writeln!(wr, "  Requests/sec:\t{:.2}", report.rps)?;
    writeln!(wr, "  End reason:\t{}", report.end_reason)?;

    if !report.histogram.is_empty() {
        let max = report.histogram.iter().map(|b| b.count).max().unwrap_or(1).max(1);

        writeln!(wr)?;
        writeln!(wr, "Response time histogram:")?;
        for bucket in &report.histogram {
            let bar = "∎".repeat((bucket.count * BAR_WIDTH / max) as usize);
            writeln!(
                wr,
                "  {:>10.3} [{}]\t|{}",
                bucket.mark.as_secs_f64() * 1e3,
                bucket.count,
                bar
            )?;
        }

        writeln!(wr)?;
        writeln!(wr, "Latency distribution:")?;
        for v in &report.latency_distribution {
            writeln!(wr, "  {} % in {}", v.percentage, ms(v.latency))?;
        }
    }

    if !report.status_code_distribution.is_empty() {
        writeln!(wr)?;
        writeln!(wr, "Status code distribution:")?;
        for (status, count) in &report.status_code_distribution {
            writeln!(wr, "  [{status}]\t{count} responses")?;
        }
    }

    if !report.error_distribution.is_empty() {
        writeln!(wr)?;
        writeln!(wr, "Error distribution:")?;
        for (err, count) in &report.error_distribution {
            writeln!(wr, "  [{count}]\t{err}")?;
        }
    }

    Ok(())
}
