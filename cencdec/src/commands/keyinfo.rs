use super::read_blob;
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use vsd_cenc::{KeyInfoRecord, sai::SampleAuxInfo};

#[derive(Args, Clone, Debug)]
/// Dump and validate a key info blob.
pub struct Keyinfo {
    /// Key info data.
    #[arg(required = true, value_name = "PATH|HEX")]
    input: String,

    /// Parse this sample auxiliary information against the key info.
    #[arg(long, value_name = "PATH|HEX")]
    sai: Option<String>,

    /// Size of the sample the auxiliary information belongs to, checks the subsample layout.
    #[arg(long, value_name = "BYTES", requires = "sai")]
    sample_size: Option<usize>,
}

impl Keyinfo {
    pub fn execute(self) -> Result<()> {
        let data = read_blob(&self.input)?;
        let key_info = KeyInfoRecord::parse(&data)?;

        println!(
            "{} {} ({} entries)",
            "key info".bold(),
            if key_info.multi_key { "multi-key" } else { "single-key" },
            key_info.len()
        );

        for (i, entry) in key_info.entries.iter().enumerate() {
            match &entry.constant_iv {
                Some(iv) => println!(
                    "  {} kid={} constant_iv={}",
                    format!("#{}", i + 1).cyan(),
                    entry.kid_hex(),
                    hex::encode(iv)
                ),
                None => println!(
                    "  {} kid={} iv_size={}",
                    format!("#{}", i + 1).cyan(),
                    entry.kid_hex(),
                    entry.iv_size
                ),
            }
        }

        let Some(sai) = &self.sai else {
            return Ok(());
        };

        let sai = SampleAuxInfo::parse(&read_blob(sai)?, &key_info)?;
        println!("{}", "sample auxiliary information".bold());

        for iv in &sai.ivs {
            println!("  iv[{}]={}", iv.key_index, hex::encode(&iv.iv));
        }

        if sai.is_full_sample() {
            println!("  full sample encryption");
        }

        for subsample in &sai.subsamples {
            println!(
                "  key={} clear={} encrypted={}",
                subsample.key_index, subsample.clear_bytes, subsample.encrypted_bytes
            );
        }

        if let Some(size) = self.sample_size {
            sai.check_layout(size)?;
            println!("  layout matches a {} byte sample", size);
        }

        Ok(())
    }
}
