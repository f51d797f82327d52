// File: src/providers/mod.rs
//! Provider adapters and the user-facing Model trait: free text, dict-JSON,
//! typed extraction and enum classification, in matched sync and async forms.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::core::error::AugurError;
use crate::gen::{GenConf, GenError, GenOut, GenRes, OutFormat};
use crate::registry::Registry;
use crate::schema::{self, Plan, SchemaConf, Target, TargetValue};
use crate::thread::Thread;

pub mod anthropic;
pub mod llamacpp;
pub mod openai;

pub use anthropic::AnthropicModel;
pub use llamacpp::LlamaCppModel;
pub use openai::{OpenAiCompatModel, Profile};

/// An LLM model exposing generation plus the structured call forms.
/// Adapters implement the required methods; the structured calls are
/// provided on top of them.
#[async_trait]
pub trait Model: Send + Sync {
    // ===================================================== adapter surface

    /// Text generation from a Thread. Doesn't raise for provider-returned
    /// generation outcomes - those are reported in the GenOut result.
    fn gen(&self, thread: &Thread, genconf: Option<&GenConf>) -> Result<GenOut, AugurError>;

    /// Async form of gen().
    async fn gen_async(
        &self,
        thread: &Thread,
        genconf: Option<&GenConf>,
    ) -> Result<GenOut, AugurError>;

    /// Calculate or estimate the token length of a thread, as the model's
    /// context accounting will see it. Estimates must be an upper bound.
    /// Local adapters measure exactly, which may involve a server roundtrip.
    fn token_len(&self, thread: &Thread, genconf: Option<&GenConf>) -> Result<usize, AugurError>;

    /// Async form of token_len(). Adapters whose accounting is pure
    /// computation inherit this delegation.
    async fn token_len_async(
        &self,
        thread: &Thread,
        genconf: Option<&GenConf>,
    ) -> Result<usize, AugurError> {
        self.token_len(thread, genconf)
    }

    /// Maximum context length, shared by input and output
    fn ctx_len(&self) -> usize;

    /// Cap on emitted output tokens
    fn max_tokens_limit(&self) -> usize;

    fn name(&self) -> String;

    fn desc(&self) -> String;

    /// Default generation configuration, used when a call passes None
    fn default_genconf(&self) -> &GenConf;

    /// Property name used when an output key must be created for JSON output
    fn output_key_name(&self) -> &str {
        "output"
    }

    /// Function name used by adapters that extract JSON via a tools API
    fn output_fn_name(&self) -> &str {
        "json_out"
    }

    // ===================================================== context arithmetic

    /// Maximum output tokens available after the given input length.
    /// May be non-positive when the input doesn't fit.
    fn calc_max_max_tokens(&self, input_len: usize) -> i64 {
        let avail = self.ctx_len() as i64 - input_len as i64;
        avail.min(self.max_tokens_limit() as i64)
    }

    /// Resolve genconf.max_tokens to a definitive value given the input
    /// length, ctx_len and max_tokens_limit.
    fn resolve_genconf_max_tokens(
        &self,
        input_len: usize,
        genconf: &GenConf,
    ) -> Result<usize, AugurError> {
        let avail = self.calc_max_max_tokens(input_len);
        if avail <= 0 {
            return Err(AugurError::ContextOverflow {
                input_len,
                ctx_len: self.ctx_len(),
                max_tokens_limit: self.max_tokens_limit(),
            });
        }
        let resolved = genconf.resolve_max_tokens(self.ctx_len(), Some(self.max_tokens_limit()));
        Ok(resolved.min(avail as usize))
    }

    // ===================================================== result-returning

    /// JSON generation, optionally constrained by a schema, returning the
    /// parsed value in GenOut::dic. Never raises for generation outcomes.
    fn gen_json(
        &self,
        thread: &Thread,
        json_schema: Option<&JsonValue>,
        genconf: Option<&GenConf>,
        massage_schema: bool,
        schemaconf: Option<&SchemaConf>,
    ) -> Result<GenOut, AugurError> {
        let genconf = make_json_genconf(
            self.base_genconf(genconf),
            json_schema,
            massage_schema,
            schemaconf,
        )?;
        self.gen(thread, Some(&genconf))
    }

    async fn gen_json_async(
        &self,
        thread: &Thread,
        json_schema: Option<&JsonValue>,
        genconf: Option<&GenConf>,
        massage_schema: bool,
        schemaconf: Option<&SchemaConf>,
    ) -> Result<GenOut, AugurError> {
        let genconf = make_json_genconf(
            self.base_genconf(genconf),
            json_schema,
            massage_schema,
            schemaconf,
        )?;
        self.gen_async(thread, Some(&genconf)).await
    }

    /// Typed extraction: compile the target, generate constrained JSON, then
    /// instantiate a native value into GenOut::value. Never raises for
    /// generation outcomes; schema compile failures raise before dispatch.
    fn gen_extract(
        &self,
        target: &Target,
        thread: &Thread,
        genconf: Option<&GenConf>,
        schemaconf: Option<&SchemaConf>,
    ) -> Result<GenOut, AugurError> {
        let conf = extract_conf(schemaconf, self.output_key_name());
        let (json_schema, plan) = schema::compile(target, &conf)?;
        let out = self.gen_json(thread, Some(&json_schema), genconf, false, Some(&conf))?;
        Ok(finish_extract(out, &plan))
    }

    async fn gen_extract_async(
        &self,
        target: &Target,
        thread: &Thread,
        genconf: Option<&GenConf>,
        schemaconf: Option<&SchemaConf>,
    ) -> Result<GenOut, AugurError> {
        let conf = extract_conf(schemaconf, self.output_key_name());
        let (json_schema, plan) = schema::compile(target, &conf)?;
        let out = self
            .gen_json_async(thread, Some(&json_schema), genconf, false, Some(&conf))
            .await?;
        Ok(finish_extract(out, &plan))
    }

    // ===================================================== raising forms

    /// Free text generation. Raises GenError for non-OK results; a length
    /// stop is only an error when ok_length_is_error is set.
    fn call(
        &self,
        query: &Thread,
        genconf: Option<&GenConf>,
        ok_length_is_error: bool,
    ) -> Result<String, AugurError> {
        let out = self.gen(query, genconf)?;
        let out = GenError::raise_if_error(out, ok_length_is_error)?;
        Ok(out.text)
    }

    async fn call_async(
        &self,
        query: &Thread,
        genconf: Option<&GenConf>,
        ok_length_is_error: bool,
    ) -> Result<String, AugurError> {
        let out = self.gen_async(query, genconf).await?;
        let out = GenError::raise_if_error(out, ok_length_is_error)?;
        Ok(out.text)
    }

    /// Dict-JSON generation returning the parsed value. Raises GenError for
    /// non-OK results; tolerates truncated-but-valid JSON unless
    /// ok_length_is_error is set.
    fn json(
        &self,
        query: &Thread,
        json_schema: Option<&JsonValue>,
        genconf: Option<&GenConf>,
        ok_length_is_error: bool,
    ) -> Result<JsonValue, AugurError> {
        let out = self.gen_json(query, json_schema, genconf, true, None)?;
        let out = GenError::raise_if_error(out, ok_length_is_error)?;
        take_dic(out)
    }

    async fn json_async(
        &self,
        query: &Thread,
        json_schema: Option<&JsonValue>,
        genconf: Option<&GenConf>,
        ok_length_is_error: bool,
    ) -> Result<JsonValue, AugurError> {
        let out = self
            .gen_json_async(query, json_schema, genconf, true, None)
            .await?;
        let out = GenError::raise_if_error(out, ok_length_is_error)?;
        take_dic(out)
    }

    /// Typed extraction returning the instantiated value. Raises GenError
    /// for non-OK results.
    fn extract(
        &self,
        target: &Target,
        query: &Thread,
        genconf: Option<&GenConf>,
        ok_length_is_error: bool,
    ) -> Result<TargetValue, AugurError> {
        let out = self.gen_extract(target, query, genconf, None)?;
        let out = GenError::raise_if_error(out, ok_length_is_error)?;
        take_value(out)
    }

    async fn extract_async(
        &self,
        target: &Target,
        query: &Thread,
        genconf: Option<&GenConf>,
        ok_length_is_error: bool,
    ) -> Result<TargetValue, AugurError> {
        let out = self.gen_extract_async(target, query, genconf, None).await?;
        let out = GenError::raise_if_error(out, ok_length_is_error)?;
        take_value(out)
    }

    /// Enum classification: the target must be an enum of same-typed labels.
    fn classify(
        &self,
        labels: &Target,
        query: &Thread,
        genconf: Option<&GenConf>,
        ok_length_is_error: bool,
    ) -> Result<TargetValue, AugurError> {
        check_classify_labels(labels)?;
        self.extract(labels, query, genconf, ok_length_is_error)
    }

    async fn classify_async(
        &self,
        labels: &Target,
        query: &Thread,
        genconf: Option<&GenConf>,
        ok_length_is_error: bool,
    ) -> Result<TargetValue, AugurError> {
        check_classify_labels(labels)?;
        self.extract_async(labels, query, genconf, ok_length_is_error)
            .await
    }

    /// The effective base genconf for a call: the passed one or the model's
    /// default.
    fn base_genconf(&self, genconf: Option<&GenConf>) -> GenConf {
        genconf
            .cloned()
            .unwrap_or_else(|| self.default_genconf().clone())
    }
}

fn check_classify_labels(labels: &Target) -> Result<(), AugurError> {
    match labels.base() {
        Target::Enum(_) => Ok(()),
        _ => Err(AugurError::SchemaCompile(
            "Classify labels must be an enum target of same-typed values".to_string(),
        )),
    }
}

fn make_json_genconf(
    base: GenConf,
    json_schema: Option<&JsonValue>,
    massage_schema: bool,
    schemaconf: Option<&SchemaConf>,
) -> Result<GenConf, AugurError> {
    if base.json_schema.is_some() && json_schema.is_some() {
        log::warn!("Both genconf.json_schema and the json_schema arg are set: using the arg");
    }
    let json_schema = match json_schema.or(base.json_schema.as_ref()) {
        Some(schema) if massage_schema => {
            let conf = schemaconf.cloned().unwrap_or_default();
            Some(schema::massage(schema, &conf))
        }
        Some(schema) => Some(schema.clone()),
        None => None,
    };
    Ok(base
        .with_format(OutFormat::Json)
        .with_json_schema(json_schema))
}

fn extract_conf(schemaconf: Option<&SchemaConf>, output_key_name: &str) -> SchemaConf {
    let mut conf = schemaconf.cloned().unwrap_or_default();
    conf.output_key_name = output_key_name.to_string();
    conf
}

/// Instantiate the plan against a successful JSON result, downgrading to a
/// schema-value error when coercion fails.
fn finish_extract(mut out: GenOut, plan: &Plan) -> GenOut {
    if let Some(dic) = &out.dic {
        match schema::instantiate(plan, dic) {
            Ok(value) => out.value = Some(value),
            Err(e) => {
                out.res = GenRes::ErrorJsonSchemaVal;
                out.text.push_str(&format!("\nSchema value error: {}", e));
            }
        }
    }
    out
}

fn take_dic(out: GenOut) -> Result<JsonValue, AugurError> {
    match out.dic {
        Some(dic) => Ok(dic),
        None => Err(AugurError::Generation(GenError { out })),
    }
}

fn take_value(out: GenOut) -> Result<TargetValue, AugurError> {
    match out.value {
        Some(value) => Ok(value),
        None => Err(AugurError::Generation(GenError { out })),
    }
}

/// Character-to-token estimation shared by remote adapters without an
/// installed tokenizer: text length times a factor, a fixed overhead per
/// message, and a schema-size surcharge when a schema is attached.
pub(crate) fn estimate_token_len(
    thread: &Thread,
    genconf: Option<&GenConf>,
    factor: f64,
    overhead_per_msg: usize,
) -> usize {
    let mut num_tokens = 0.0;

    if !thread.inst.text.is_empty() {
        num_tokens += thread.inst.text.len() as f64 * factor + overhead_per_msg as f64;
    }
    for msg in thread.iter() {
        let mut chars = msg.text.len();
        for image in &msg.images {
            chars += image.url.len();
        }
        num_tokens += chars as f64 * factor + overhead_per_msg as f64;
    }

    if let Some(schema) = genconf.and_then(|g| g.json_schema.as_ref()) {
        num_tokens += schema.to_string().len() as f64 * factor;
    }

    num_tokens.ceil() as usize
}

/// Create a model from a registry entry, dispatching to the adapter for the
/// resolved provider. genconf and ctx_len override any directory defaults.
pub fn create(
    registry: &Registry,
    res_name: &str,
    genconf: Option<GenConf>,
    ctx_len: Option<usize>,
) -> Result<Box<dyn Model>, AugurError> {
    let (provider, _name, mut entry) = registry.resolve_model_entry(res_name)?;

    if let Some(genconf) = genconf {
        entry.genconf = Some(genconf);
    }
    if let Some(ctx_len) = ctx_len {
        entry.ctx_len = Some(ctx_len);
    }

    match provider.as_str() {
        "openai" => Ok(Box::new(OpenAiCompatModel::from_entry(
            openai::profiles::OPENAI,
            &entry,
        )?)),
        "mistral" => Ok(Box::new(OpenAiCompatModel::from_entry(
            openai::profiles::MISTRAL,
            &entry,
        )?)),
        "groq" => Ok(Box::new(OpenAiCompatModel::from_entry(
            openai::profiles::GROQ,
            &entry,
        )?)),
        "fireworks" => Ok(Box::new(OpenAiCompatModel::from_entry(
            openai::profiles::FIREWORKS,
            &entry,
        )?)),
        "together" => Ok(Box::new(OpenAiCompatModel::from_entry(
            openai::profiles::TOGETHER,
            &entry,
        )?)),
        "anthropic" => Ok(Box::new(AnthropicModel::from_entry(&entry)?)),
        "llamacpp" => Ok(Box::new(LlamaCppModel::from_entry(registry, &entry)?)),
        other => Err(AugurError::Registry(format!(
            "Unknown provider '{}' for '{}'",
            other, res_name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubModel {
        ctx_len: usize,
        max_tokens_limit: usize,
        genconf: GenConf,
    }

    #[async_trait]
    impl Model for StubModel {
        fn gen(&self, _thread: &Thread, _genconf: Option<&GenConf>) -> Result<GenOut, AugurError> {
            Ok(GenOut::new(GenRes::ErrorModel, "stub"))
        }

        async fn gen_async(
            &self,
            thread: &Thread,
            genconf: Option<&GenConf>,
        ) -> Result<GenOut, AugurError> {
            self.gen(thread, genconf)
        }

        fn token_len(
            &self,
            _thread: &Thread,
            _genconf: Option<&GenConf>,
        ) -> Result<usize, AugurError> {
            Ok(0)
        }

        fn ctx_len(&self) -> usize {
            self.ctx_len
        }

        fn max_tokens_limit(&self) -> usize {
            self.max_tokens_limit
        }

        fn name(&self) -> String {
            "stub".to_string()
        }

        fn desc(&self) -> String {
            "StubModel".to_string()
        }

        fn default_genconf(&self) -> &GenConf {
            &self.genconf
        }
    }

    fn stub(ctx_len: usize, max_tokens_limit: usize) -> StubModel {
        StubModel {
            ctx_len,
            max_tokens_limit,
            genconf: GenConf::new(),
        }
    }

    #[test]
    fn test_resolve_genconf_max_tokens_all_available() {
        // max_tokens 0 with ctx_len 2048 and 100 input tokens
        let m = stub(2048, 2048);
        let resolved = m
            .resolve_genconf_max_tokens(100, &GenConf::new())
            .unwrap();
        assert_eq!(resolved, 1948);
    }

    #[test]
    fn test_resolve_genconf_max_tokens_clamps_to_limit() {
        let m = stub(2048, 512);
        let resolved = m
            .resolve_genconf_max_tokens(100, &GenConf::new())
            .unwrap();
        assert_eq!(resolved, 512);

        let resolved = m
            .resolve_genconf_max_tokens(100, &GenConf::new().with_max_tokens(-50))
            .unwrap();
        assert_eq!(resolved, 512);
    }

    #[test]
    fn test_context_overflow_rejected() {
        let m = stub(2048, 2048);
        let err = m.resolve_genconf_max_tokens(2048, &GenConf::new());
        assert!(matches!(err, Err(AugurError::ContextOverflow { .. })));

        let err = m.resolve_genconf_max_tokens(5000, &GenConf::new());
        assert!(matches!(err, Err(AugurError::ContextOverflow { .. })));
    }

    #[test]
    fn test_classify_requires_enum_labels() {
        let m = stub(2048, 2048);
        let err = m.classify(&Target::Str, &Thread::make_in("q"), None, false);
        assert!(matches!(err, Err(AugurError::SchemaCompile(_))));
    }
}
