use std::path::PathBuf;

use clap::Args;

use super::CliContext;
use chatflow::schema::write_schema;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Directory the schema files are written to
    pub out_dir: PathBuf,
}

pub async fn execute(args: SchemaArgs, _context: &CliContext) -> anyhow::Result<()> {
    for path in write_schema(&args.out_dir)? {
        println!("wrote {}", path.display());
    }
    Ok(())
}
