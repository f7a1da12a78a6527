use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "warden", about = "Warden identity authority administration", version)]
pub struct Cli {
    /// PostgreSQL connection URL.
    #[arg(
        long,
        global = true,
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/warden"
    )]
    pub database_url: String,

    /// Maximum number of database connections in the pool.
    #[arg(long, global = true, default_value_t = 5)]
    pub max_connections: u32,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply pending schema migrations.
    Migrate,

    /// Create an activated user.
    CreateUser {
        #[arg(long)]
        email: String,

        /// Defaults to `user-<id>`.
        #[arg(long)]
        username: Option<String>,

        #[arg(long, env = "WARDEN_NEW_USER_PASSWORD")]
        password: Option<String>,

        /// Add the user to the admin group.
        #[arg(long, default_value_t = false)]
        admin: bool,
    },

    /// Enable or disable a user.
    SetEnabled {
        #[arg(long)]
        email: String,

        #[arg(long, action = ArgAction::Set)]
        enabled: bool,
    },

    /// Mail a password reset link.
    ForgotPassword {
        #[arg(long)]
        email: String,
    },

    /// Complete a password reset with the mailed code.
    ResetPassword {
        #[arg(long)]
        code: String,

        #[arg(long, env = "WARDEN_NEW_PASSWORD")]
        password: String,
    },

    /// Log in and print the bearer token as JSON.
    Login {
        /// Username or email.
        #[arg(long)]
        identifier: String,

        #[arg(long, env = "WARDEN_PASSWORD")]
        password: String,
    },

    /// Delete expired activation tokens and authorization codes.
    PurgeTokens,

    /// Print version.
    Version,
}
