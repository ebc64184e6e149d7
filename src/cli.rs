use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Wait for another recall process to release the corpus
    /// instead of failing
    #[clap(long, global = true, default_value = "false")]
    pub wait: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Add a note
    Add {
        /// Note text
        text: String,

        /// Metadata as key=value, repeatable
        #[clap(short, long = "meta", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
    },
    /// Find the notes and document chunks closest to a query
    Search {
        query: String,

        /// Maximum number of results (config default when omitted)
        #[clap(short, long)]
        limit: Option<usize>,
    },
    /// Chunk, embed and store a text document
    Index {
        path: PathBuf,

        /// Document title (file name when omitted)
        #[clap(short, long)]
        title: Option<String>,
    },
    /// Delete an item and its embedding
    Delete { id: u64 },
    /// Delete a document with all its chunks
    DeleteDocument { id: u64 },
    /// Show corpus and model status
    Status {},
    /// Re-embed every item with the active model
    Migrate {
        /// Run even when the corpus is already consistent
        #[clap(short, long, default_value = "false")]
        force: bool,
    },
    /// Export all embeddings as CSV
    Export { out: PathBuf },
    /// Print the chunks a file would be split into, without storing anything
    Chunk {
        path: PathBuf,

        /// Split on blank lines instead of sentences
        #[clap(long, default_value = "false")]
        paragraphs: bool,
    },
}

impl Command {
    /// Whether the command writes to the corpus.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Command::Add { .. }
                | Command::Index { .. }
                | Command::Delete { .. }
                | Command::DeleteDocument { .. }
                | Command::Migrate { .. }
        )
    }

    /// Whether the command needs the embedding model loaded.
    pub fn needs_model(&self) -> bool {
        !matches!(self, Command::Export { .. } | Command::Chunk { .. })
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
