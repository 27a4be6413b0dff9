use anyhow::{Context, Result};
use log::info;

use crate::{blob::ByteSource, cli::PreviewArgs, config, scan, scan::Slice, table};

pub fn execute<S: ByteSource + ?Sized>(args: &PreviewArgs, source: &S) -> Result<()> {
    let blob = &args.source.blob;
    let options = config::scan_options(&args.source)?;
    let bytes = source
        .fetch(blob)
        .with_context(|| format!("Fetching blob '{blob}'"))?;
    let mut view = scan::open(blob, bytes, &options).with_context(|| format!("Opening '{blob}'"))?;
    let batch = match view
        .slice(0, args.rows)
        .with_context(|| format!("Reading the first {} row(s) of '{blob}'", args.rows))?
    {
        Slice::Rows(batch) => batch,
        Slice::EndOfData => crate::batch::Batch::empty(view.schema().to_vec()),
    };

    table::print_batch(&batch);
    info!("Displayed {} row(s) from '{blob}'", batch.len());
    Ok(())
}
