//! Issue a signed tracking token from the command line.
//!
//! Uses the same codec as `POST /api/pixel-token`, for operators who embed
//! pixels without going through the API.
//!
//! # Usage
//!
//! ```bash
//! PIXELTRAIL_SECRET=... pixel-token --message m_123 --campaign c_12 --recipient r_9 \
//!     --recipient-email you@company.com --days 45 --base https://track.example.com
//! ```
//!
//! Prints the token, or the full pixel URL when `--base` is given.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use pixeltrail_core::{TokenCodec, TrackingPayload, normalize_email};

/// Issue a signed pixel tracking token.
#[derive(Parser, Debug)]
#[command(name = "pixel-token")]
#[command(about = "Issue a signed pixel tracking token")]
struct Args {
    /// Message id (required)
    #[arg(long, short = 'm')]
    message: String,

    /// Campaign id
    #[arg(long, short = 'c', default_value = "")]
    campaign: String,

    /// Recipient id
    #[arg(long, short = 'r', default_value = "")]
    recipient: String,

    /// Recipient email address
    #[arg(long)]
    recipient_email: Option<String>,

    /// Token id for log correlation (default: random UUID)
    #[arg(long)]
    token_id: Option<String>,

    /// Days until the token expires
    #[arg(long, default_value_t = 45.0)]
    days: f64,

    /// Public base URL; when set the full pixel URL is printed
    #[arg(long)]
    base: Option<String>,

    /// Signing secret
    #[arg(long, env = "PIXELTRAIL_SECRET", hide_env_values = true)]
    secret: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let message = args.message.trim();
    if message.is_empty() {
        bail!("--message must not be empty");
    }
    if !args.days.is_finite() {
        bail!("--days must be a finite number");
    }

    let codec = TokenCodec::new(Some(args.secret.as_str()));
    let token_id = args
        .token_id
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let ttl = (args.days * 86_400.0).floor() as i64;

    let mut payload = TrackingPayload::new(
        message,
        args.campaign.trim(),
        args.recipient.trim(),
        token_id,
        Utc::now().timestamp(),
        ttl,
    );
    if let Some(raw) = args.recipient_email.filter(|e| !e.trim().is_empty()) {
        let email = normalize_email(&raw)
            .with_context(|| format!("invalid --recipient-email {raw:?}"))?;
        payload = payload.with_recipient_email(email);
    }

    let token = codec.issue(&payload)?;
    match args.base.as_deref().map(|b| b.trim_end_matches('/')) {
        Some(base) if !base.is_empty() => println!("{base}/p/o.gif?t={token}"),
        _ => println!("{token}"),
    }

    Ok(())
}
