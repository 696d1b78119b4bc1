use std::time::Duration;

use clap::Parser;
use reqwest_middleware::ClientBuilder;
use tokio::time;
use tollgate_reqwest::{RefreshOptions, SecureTransport, TokenRefreshMiddleware};
use tollgate_tokens::{
    sources::oauth2::{dto::ClientCredentials, ClientCredentialsTokenSource},
    ClientId, ClientSecret, TokenCoordinator,
};

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's token request URL
    #[clap(short, long, env)]
    token_url: reqwest::Url,

    /// The client ID of the client
    #[clap(short, long, env)]
    client_id: ClientId,

    /// The client secret used to identify the client to the issuing authority
    #[clap(short = 's', long, env, hide_env_values = true)]
    client_secret: ClientSecret,

    /// The audience to request a token for
    #[clap(short, long, env)]
    audience: Option<String>,

    /// The API endpoint to call with the obtained credential
    #[clap(short = 'u', long, env)]
    api_url: reqwest::Url,

    /// Response statuses that mean the credential was rejected
    #[clap(long, env, value_delimiter = ',', default_value = "401")]
    invalid_token_statuses: Vec<u16>,

    /// Seconds to wait between calls
    #[clap(long, env, default_value_t = 5)]
    interval: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder().https_only(true).build()?;

    let mut token_source = ClientCredentialsTokenSource::new(
        client.clone(),
        opts.token_url,
        ClientCredentials {
            client_id: opts.client_id,
            client_secret: opts.client_secret,
        },
    );
    if let Some(audience) = opts.audience {
        token_source = token_source.with_body_field("audience", audience);
    }

    let options = RefreshOptions {
        invalid_token_statuses: opts.invalid_token_statuses,
        ..RefreshOptions::default()
    };

    let middleware = TokenRefreshMiddleware::new(TokenCoordinator::new(token_source))
        .with_options(&options)?
        .with_predicate(SecureTransport);

    let client = ClientBuilder::new(client).with(middleware).build();

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        match client.get(opts.api_url.clone()).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(status = resp.status().as_u16(), "call succeeded")
            }
            Ok(resp) => {
                tracing::warn!(status = resp.status().as_u16(), "call was rejected")
            }
            Err(error) => {
                tracing::error!(error = (&error as &dyn std::error::Error), "call failed")
            }
        }
    }
}
