use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Read products from a JSON export or styles.csv instead of the catalog service
    #[clap(long, global = true)]
    pub export: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct QueryArgs {
    /// Number of recommendations
    #[clap(short, long)]
    pub limit: Option<usize>,

    /// Drop candidates whose adjusted score is below this
    #[clap(long)]
    pub min_similarity: Option<f32>,
}

#[derive(ClapArgs, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct SearchInput {
    /// Local image file
    #[clap(long)]
    pub image: Option<PathBuf>,

    /// Image url
    #[clap(long)]
    pub url: Option<String>,

    /// Free-text query
    #[clap(long)]
    pub text: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the recommendation service.
    Serve {
        /// Address to listen on, overrides config
        #[clap(long)]
        listen: Option<String>,
    },

    /// Encode the catalog and write embeddings.bin and index.bin.
    Build {
        /// Encode at most this many products
        #[clap(long, default_value = "100000")]
        limit: usize,

        /// Hide the progress bar
        #[clap(long, default_value = "false")]
        quiet: bool,
    },

    /// Products visually similar to a catalog product
    Similar {
        /// Product id
        id: String,

        #[clap(flatten)]
        query: QueryArgs,

        /// Don't restrict results to the product's category
        #[clap(long, default_value = "false")]
        any_category: bool,
    },

    /// Search by image or text
    Search {
        #[clap(flatten)]
        input: SearchInput,

        #[clap(flatten)]
        query: QueryArgs,
    },

    /// Recommendations from recently viewed products, most recent first
    Personalized {
        #[clap(required = true, num_args = 1..)]
        ids: Vec<String>,

        #[clap(flatten)]
        query: QueryArgs,
    },

    /// Similar products for several ids at once
    Batch {
        #[clap(required = true, num_args = 1..)]
        ids: Vec<String>,

        #[clap(flatten)]
        query: QueryArgs,
    },

    /// Print store and index statistics
    Stats {},
}
