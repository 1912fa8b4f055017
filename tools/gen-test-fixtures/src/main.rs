use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};
use std::env;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

const ACTIVE_KID: &str = "test-key";
const RETIRED_KID: &str = "retired-key";

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::from_env(env::args().skip(1))?;
    generate_fixtures(&args.output)
}

#[derive(Debug)]
struct Args {
    output: PathBuf,
}

impl Args {
    fn from_env(mut args: impl Iterator<Item = String>) -> Result<Self, Box<dyn Error>> {
        let mut output = PathBuf::from("fixtures");

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--output" => {
                    output = PathBuf::from(args.next().ok_or("--output requires a path argument")?)
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {
                    return Err(format!("unexpected argument: {arg}\nUse --help for usage.").into());
                }
            }
        }

        Ok(Self { output })
    }
}

fn print_help() {
    eprintln!("Usage: cargo run -p gen-test-fixtures -- [--output DIR]");
}

/// Writes the signing key, an unrelated key for forged signatures, and two
/// key sets: the live one and one that only holds a retired key.
fn generate_fixtures(output_dir: &Path) -> Result<(), Box<dyn Error>> {
    let key_dir = output_dir.join("test-keys");
    fs::create_dir_all(&key_dir)?;

    let mut rng = OsRng;
    let active_private = RsaPrivateKey::new(&mut rng, 2048)?;
    let active_public = RsaPublicKey::from(&active_private);
    let wrong_private = RsaPrivateKey::new(&mut rng, 2048)?;
    let retired_private = RsaPrivateKey::new(&mut rng, 2048)?;
    let retired_public = RsaPublicKey::from(&retired_private);

    fs::write(
        key_dir.join("rsa-private.pem"),
        active_private.to_pkcs8_pem(LineEnding::LF)?.as_bytes(),
    )?;
    fs::write(
        key_dir.join("rsa-public.pem"),
        active_public.to_public_key_pem(LineEnding::LF)?,
    )?;
    fs::write(
        key_dir.join("wrong-key-private.pem"),
        wrong_private.to_pkcs8_pem(LineEnding::LF)?.as_bytes(),
    )?;

    write_key_set(&key_dir.join("jwks.json"), &active_public, ACTIVE_KID)?;
    write_key_set(&key_dir.join("jwks-rotated-out.json"), &retired_public, RETIRED_KID)?;

    Ok(())
}

fn signing_jwk(public: &RsaPublicKey, kid: &str) -> Value {
    json!({
        "kty": "RSA",
        "kid": kid,
        "use": "sig",
        "alg": "RS256",
        "n": URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
        "e": URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
    })
}

fn write_key_set(path: &Path, public: &RsaPublicKey, kid: &str) -> Result<(), Box<dyn Error>> {
    let jwks = json!({ "keys": [signing_jwk(public, kid)] });
    fs::write(path, serde_json::to_vec_pretty(&jwks)?)?;
    Ok(())
}
