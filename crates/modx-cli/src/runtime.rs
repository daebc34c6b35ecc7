//! Model runtime adapters for the service binary.
//!
//! `HttpRuntime` drives a tensor sidecar over blocking JSON calls. Every
//! call is made from a blocking thread (the orchestrator is only ever
//! entered through `spawn_blocking`), never from an async task.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;

use modx_core::{
    ActivationCapture, GenerationConfig, HookPoint, ModelInfo, ModelRuntime, ModxError,
};

#[derive(Serialize)]
struct LoadBody<'a> {
    model_id: &'a str,
}

#[derive(Serialize)]
struct TokenizeBody<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct TokensBody<'a> {
    tokens: &'a [u32],
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    tokens: &'a [u32],
    #[serde(flatten)]
    config: &'a GenerationConfig,
}

#[derive(Serialize)]
struct ForwardBody<'a> {
    tokens: &'a [u32],
    names_filter: Vec<String>,
}

#[derive(serde::Deserialize)]
struct TokensReply {
    tokens: Vec<u32>,
}

#[derive(serde::Deserialize)]
struct TextReply {
    text: String,
}

/// Client for a tensor runtime speaking JSON over HTTP.
pub struct HttpRuntime {
    client: Client,
    base_url: String,
    info: Option<ModelInfo>,
}

impl HttpRuntime {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, ModxError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ModxError::ModelLoad(format!("runtime client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            info: None,
        })
    }

    fn call<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, String> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| format!("{url}: {e}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().unwrap_or_default();
            return Err(format!("HTTP {status} from {url}: {text}"));
        }
        response
            .json()
            .map_err(|e| format!("bad reply from {url}: {e}"))
    }
}

impl ModelRuntime for HttpRuntime {
    fn load(&mut self, model_id: &str) -> Result<ModelInfo, ModxError> {
        if let Some(info) = &self.info
            && info.model_id == model_id
        {
            return Ok(info.clone());
        }
        let info: ModelInfo = self
            .call("/load", &LoadBody { model_id })
            .map_err(ModxError::ModelLoad)?;
        self.info = Some(info.clone());
        Ok(info)
    }

    fn info(&self) -> Option<&ModelInfo> {
        self.info.as_ref()
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, ModxError> {
        let reply: TokensReply = self
            .call("/tokenize", &TokenizeBody { text })
            .map_err(ModxError::Generation)?;
        Ok(reply.tokens)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, ModxError> {
        let reply: TextReply = self
            .call("/decode", &TokensBody { tokens })
            .map_err(ModxError::Generation)?;
        Ok(reply.text)
    }

    fn generate(
        &mut self,
        prompt: &[u32],
        config: &GenerationConfig,
    ) -> Result<Vec<u32>, ModxError> {
        let reply: TokensReply = self
            .call(
                "/generate",
                &GenerateBody {
                    tokens: prompt,
                    config,
                },
            )
            .map_err(ModxError::Generation)?;
        Ok(reply.tokens)
    }

    fn run_with_capture(
        &mut self,
        tokens: &[u32],
        hooks: &[HookPoint],
    ) -> Result<ActivationCapture, ModxError> {
        let body = ForwardBody {
            tokens,
            names_filter: hooks.iter().map(HookPoint::name).collect(),
        };
        self.call("/forward", &body).map_err(ModxError::Probe)
    }

    fn clear_state(&mut self) -> Result<(), ModxError> {
        let _: serde_json::Value = self
            .call("/reset", &serde_json::json!({}))
            .map_err(ModxError::Generation)?;
        Ok(())
    }
}

/// Stand-in when no runtime is configured. Nothing is ever loaded, so
/// generate requests answer "model not loaded".
pub struct DetachedRuntime;

impl ModelRuntime for DetachedRuntime {
    fn load(&mut self, model_id: &str) -> Result<ModelInfo, ModxError> {
        Err(ModxError::ModelLoad(format!(
            "cannot load {model_id}: no model runtime configured"
        )))
    }

    fn info(&self) -> Option<&ModelInfo> {
        None
    }

    fn tokenize(&self, _text: &str) -> Result<Vec<u32>, ModxError> {
        Err(ModxError::ModelNotLoaded)
    }

    fn decode(&self, _tokens: &[u32]) -> Result<String, ModxError> {
        Err(ModxError::ModelNotLoaded)
    }

    fn generate(
        &mut self,
        _prompt: &[u32],
        _config: &GenerationConfig,
    ) -> Result<Vec<u32>, ModxError> {
        Err(ModxError::ModelNotLoaded)
    }

    fn run_with_capture(
        &mut self,
        _tokens: &[u32],
        _hooks: &[HookPoint],
    ) -> Result<ActivationCapture, ModxError> {
        Err(ModxError::ModelNotLoaded)
    }
}
