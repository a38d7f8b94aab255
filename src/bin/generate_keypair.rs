//! Writes an Ed25519 token-signing keypair in the format the server loads.
//!
//! ```bash
//! cargo run --bin generate_keypair -- --out-seed keys/jwt_seed --out-pub keys/jwt_pub [--force]
//! ```
//!
//! The seed file (base64, mode 0600 on unix) goes to `JWT_PRIVATE_KEY_PATH`,
//! the public key file (base64) to `JWT_PUBLIC_KEY_PATH`.

use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use ed25519_dalek::SigningKey;
use rand::RngCore;

const USAGE: &str = "Usage: generate_keypair --out-seed <path> --out-pub <path> [--force]";

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let mut out_seed: Option<PathBuf> = None;
    let mut out_pub: Option<PathBuf> = None;
    let mut force = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--out-seed" => out_seed = args.next().map(PathBuf::from),
            "--out-pub" => out_pub = args.next().map(PathBuf::from),
            "--force" => force = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                return Ok(());
            }
            other => bail!("unknown arg {other}\n{USAGE}"),
        }
    }
    let (Some(out_seed), Some(out_pub)) = (out_seed, out_pub) else {
        bail!(USAGE);
    };

    for path in [&out_seed, &out_pub] {
        if path.exists() && !force {
            bail!("refusing to overwrite {}, use --force", path.display());
        }
    }

    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    let verifying = SigningKey::from_bytes(&seed).verifying_key();

    write_key(&out_seed, &B64.encode(seed), 0o600)?;
    write_key(&out_pub, &B64.encode(verifying.as_bytes()), 0o644)?;
    seed.fill(0);

    println!("wrote signing seed to {}", out_seed.display());
    println!("wrote public key to {}", out_pub.display());
    Ok(())
}

fn write_key(path: &Path, contents: &str, #[allow(unused)] mode: u32) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(mode);
    let mut file = opts
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{contents}").with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
