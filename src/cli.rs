use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct UserArgs {
    /// User the request is made for
    #[clap(short, long, default_value = "cli")]
    pub user: String,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct LocationArgs {
    /// Latitude of the user
    #[clap(long, allow_hyphen_values = true)]
    pub lat: f64,

    /// Longitude of the user
    #[clap(long, allow_hyphen_values = true)]
    pub lng: f64,

    #[clap(flatten)]
    pub user_args: UserArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate api docs in markdown format
    #[cfg(feature = "markdown-docs")]
    #[clap(hide = true)]
    MarkdownDocs {},

    /// Start the http api and the job workers.
    Serve {},

    /// Create the vector collections if they are missing.
    Provision {},

    /// Recompute embeddings for the whole catalogue.
    Reindex {},

    /// Semantic text search, e.g. "4.5 stars in Jubilee Hills lehenga"
    Search {
        /// Free-text query
        #[clap(allow_hyphen_values = true)]
        query: String,

        #[clap(flatten)]
        user_args: UserArgs,
    },

    /// Find catalogue entities that look like an image
    ImageSearch {
        /// Local file path or http(s) url
        image: String,

        /// Print the job id and exit instead of waiting for the result
        #[clap(long, default_value = "false")]
        no_wait: bool,

        #[clap(flatten)]
        user_args: UserArgs,
    },

    /// Show a search job
    Job {
        /// Job id
        id: String,
    },

    /// Boutiques and dress types near a location
    Nearby {
        #[clap(flatten)]
        location: LocationArgs,
    },

    /// Category suggestions for a user near a location
    Categories {
        #[clap(flatten)]
        location: LocationArgs,
    },
}
