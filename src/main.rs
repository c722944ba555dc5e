//! Graft CLI - tools for working with type encodings
//!
//! Commands:
//!   graft inspect <encoding>  - Display the signature and ABI layout of an encoding

use clap::{Parser, Subcommand};
use graft::{Signature, SignatureLayout, TypeNode};

#[derive(Parser)]
#[command(name = "graft")]
#[command(about = "Tools for working with call-signature encodings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a signature encoding and display its types and layout
    Inspect {
        /// Signature encoding, return type first (e.g. "i@:ii")
        encoding: String,

        /// Treat the encoding as a closure signature (no implicit receiver)
        #[arg(long)]
        closure: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect {
            encoding,
            closure,
            json,
        } => inspect_command(&encoding, closure, json),
    }
}

fn inspect_command(encoding: &str, closure: bool, json: bool) -> anyhow::Result<()> {
    let signature = if closure {
        Signature::closure_from_encoding(encoding)
    } else {
        Signature::from_encoding(encoding)
    }
    .map_err(|e| anyhow::anyhow!("Failed to parse {encoding:?}: {e}"))?;

    let layout = SignatureLayout::of(&signature)
        .map_err(|e| anyhow::anyhow!("No calling convention for {encoding:?}: {e}"))?;

    if json {
        print_json(&signature, &layout)
    } else {
        print_signature(&signature, &layout);
        Ok(())
    }
}

fn print_signature(signature: &Signature, layout: &SignatureLayout) {
    println!("signature: {signature}");
    println!("digest: {}", signature.digest().to_hex());
    println!("return:");
    println!("  {}  size {}  align {}", signature.ret(), layout.ret.size, layout.ret.align);
    if !signature.args().is_empty() {
        println!("arguments:");
        for (index, (ty, desc)) in signature.args().iter().zip(layout.args.iter()).enumerate() {
            println!("  [{index}] {ty}  size {}  align {}", desc.size, desc.align);
        }
    }
}

fn print_json(signature: &Signature, layout: &SignatureLayout) -> anyhow::Result<()> {
    let output = serde_json::json!({
        "encoding": signature.encoding(),
        "digest": signature.digest().to_hex(),
        "return": type_to_json(signature.ret(), layout.ret.size, layout.ret.align),
        "arguments": signature
            .args()
            .iter()
            .zip(layout.args.iter())
            .map(|(ty, desc)| type_to_json(ty, desc.size, desc.align))
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn type_to_json(ty: &TypeNode, size: usize, align: usize) -> serde_json::Value {
    serde_json::json!({
        "type": ty.to_string(),
        "size": size,
        "align": align,
    })
}
