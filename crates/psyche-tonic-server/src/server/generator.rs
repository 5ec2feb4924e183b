//! Generator backends selectable at startup.
//!
//! - [`EchoGenerator`] returns copies of the input image. It keeps the whole
//!   pipeline runnable without a GPU.
//! - [`HttpGenerator`] forwards each job to a model service that speaks a
//!   small JSON protocol:
//!
//! ```text
//! POST <GENERATOR_URL>
//! {"image": "<base64>", "prompt": "...", "num_images": 4,
//!  "num_inference_steps": 2, "strength": 0.8, "guidance_scale": 0.0, "seed": null}
//!
//! 200 OK
//! {"images": ["<base64>", ...]}
//! ```

use crate::server::config::GeneratorConfig;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use core::time::Duration;
use psyche_tonic_core::psyche::{GenerationError, Generator, Job};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

/// Generous upper bound for a full batch on a busy accelerator.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// The backend chosen by [`GeneratorConfig`].
pub enum Backend {
    Echo(EchoGenerator),
    Http(HttpGenerator),
}

impl Backend {
    pub fn from_config(config: &GeneratorConfig) -> anyhow::Result<Self> {
        Ok(match config {
            GeneratorConfig::Echo => Self::Echo(EchoGenerator),
            GeneratorConfig::Http { url } => Self::Http(HttpGenerator::new(url.clone())?),
        })
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Echo(_) => "echo",
            Self::Http(_) => "http",
        }
    }
}

impl Generator for Backend {
    async fn generate(&mut self, job: &Job) -> Result<Vec<Bytes>, GenerationError> {
        match self {
            Self::Echo(generator) => generator.generate(job).await,
            Self::Http(generator) => generator.generate(job).await,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EchoGenerator;

impl Generator for EchoGenerator {
    async fn generate(&mut self, job: &Job) -> Result<Vec<Bytes>, GenerationError> {
        Ok(vec![job.input_image().clone(); job.kind().result_count()])
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    image: String,
    prompt: &'a str,
    num_images: usize,
    num_inference_steps: u32,
    strength: f32,
    guidance_scale: f32,
    seed: Option<i64>,
}

impl<'a> GenerateRequest<'a> {
    fn from_job(job: &'a Job) -> Self {
        let params = job.params();
        Self {
            image: STANDARD.encode(job.input_image()),
            prompt: job.prompt(),
            num_images: job.kind().result_count(),
            num_inference_steps: params.num_inference_steps,
            strength: params.strength,
            guidance_scale: params.guidance_scale,
            seed: params.seed,
        }
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    images: Vec<String>,
}

impl GenerateResponse {
    fn decode(self) -> Result<Vec<Bytes>, GenerationError> {
        self.images
            .iter()
            .enumerate()
            .map(|(i, encoded)| {
                STANDARD.decode(encoded).map(Bytes::from).map_err(|e| {
                    GenerationError::Backend(format!("image {i} is not valid base64: {e}"))
                })
            })
            .collect()
    }
}

pub struct HttpGenerator {
    client: Client,
    url: Url,
}

impl HttpGenerator {
    pub fn new(url: Url) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, url })
    }
}

impl Generator for HttpGenerator {
    async fn generate(&mut self, job: &Job) -> Result<Vec<Bytes>, GenerationError> {
        let backend = |e: reqwest::Error| GenerationError::Backend(e.to_string());

        let response = self
            .client
            .post(self.url.clone())
            .json(&GenerateRequest::from_job(job))
            .send()
            .await
            .map_err(backend)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Backend(format!("HTTP {status}: {body}")));
        }

        response
            .json::<GenerateResponse>()
            .await
            .map_err(backend)?
            .decode()
    }
}
