use super::read_blob;
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use vsd_cenc::pssh::{PsshRecord, uuid};

#[derive(Args, Clone, Debug)]
/// Dump protection system specific headers.
pub struct Pssh {
    /// Record list or pssh boxes.
    #[arg(required = true, value_name = "PATH|HEX|BASE64")]
    input: String,

    /// Recover the content keys carried by bootstrap headers.
    #[arg(long)]
    unwrap: bool,
}

impl Pssh {
    pub fn execute(self) -> Result<()> {
        let data = match read_blob(&self.input) {
            Ok(data) => data,
            Err(_) => read_blob(&format!("base64:{}", self.input))?,
        };
        let records = PsshRecord::parse_any(&data)?;

        for record in &records {
            println!(
                "{} {} (v{}, {} bytes of private data)",
                record.system_name().bold(),
                uuid(&record.system_id),
                record.version,
                record.private_data.len()
            );

            for kid in &record.kids {
                println!("  kid={}", hex::encode(kid));
            }

            if !record.is_bootstrap() {
                continue;
            }

            if let Some(url) = record.bootstrap_url()
                && !url.is_empty()
            {
                println!("  url={}", url);
            }

            if self.unwrap {
                for (kid, key) in record.bootstrap_keys()? {
                    println!("  {}:{}", hex::encode(kid), hex::encode(key).green());
                }
            }
        }

        Ok(())
    }
}
