//! 视觉模型服务 - 业务能力层
//!
//! 只负责"看图返回文字"能力，不关心流程
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 图片以 base64 data URL 形式内联在用户消息中
//! - 兼容 OpenAI API 的服务（如 Gemini 的 OpenAI 兼容端点）

use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{AppResult, VisionError};
use crate::services::captcha::Recognizer;

/// 验证码识别提示词
pub const CAPTCHA_PROMPT: &str = "Lee el texto de esta imagen CAPTCHA. \
Responde SOLO con los caracteres alfanuméricos que ves, sin espacios ni explicaciones.";

/// SUNARP 车辆信息提取提示词
pub const VEHICLE_PROMPT: &str = r#"Analiza esta imagen de una consulta vehicular de SUNARP (Registro Público Peruano).

Busca específicamente la sección que dice "DATOS DEL VEHÍCULO" y extrae SOLO la información contenida en esa sección.

Extrae EXACTAMENTE estos campos en el formato original:

Nº PLACA: [valor]
Nº SERIE: [valor]
Nº VIN: [valor]
Nº MOTOR: [valor]
COLOR: [valor]
MARCA: [valor]
MODELO: [valor]
PLACA VIGENTE: [valor]
PLACA ANTERIOR: [valor]
ESTADO: [valor]
ANOTACIONES: [valor]

INSTRUCCIONES IMPORTANTES:
1. Extrae SOLO los datos de la sección "DATOS DEL VEHÍCULO"
2. IGNORA el texto de fondo/watermark ("sunarp", "Superintendencia Nacional de los Registros Públicos", etc.)
3. IGNORA los encabezados, títulos y logotipos
4. Devuelve SOLO los 11 campos listados arriba, uno por línea
5. Mantén el formato exacto con los dos puntos (:)
6. Si algún campo no está presente, escríbelo igual pero déjalo vacío"#;

/// 视觉模型服务
///
/// 职责：
/// - 调用兼容 OpenAI 的视觉模型
/// - 只处理单张图片
/// - 不关心门户、表单或持久化
pub struct VisionService {
    client: Client<OpenAIConfig>,
    model_name: String,
}

impl VisionService {
    /// 创建新的视觉模型服务
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.vision_api_key)
            .with_api_base(&config.vision_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.vision_model_name.clone(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// 发送一张图片和提示词，返回模型输出的文本
    ///
    /// # 参数
    /// - `prompt`: 提示词
    /// - `image`: 图片字节
    /// - `mime`: 图片 MIME 类型，如 `image/png`
    pub async fn send_image(&self, prompt: &str, image: &[u8], mime: &str) -> AppResult<String> {
        debug!(
            "调用视觉模型，模型: {}, 图片: {} 字节",
            self.model_name,
            image.len()
        );

        let content_parts = vec![
            ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText {
                    text: prompt.to_string(),
                },
            ),
            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImage {
                    image_url: ImageUrl {
                        url: to_data_url(image, mime),
                        detail: Some(ImageDetail::High),
                    },
                },
            ),
        ];

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
            .build()
            .map_err(|e| self.api_error(e))?;
        let messages = vec![ChatCompletionRequestMessage::User(user_msg)];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(0.0)
            .max_tokens(1024u32)
            .build()
            .map_err(|e| self.api_error(e))?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("视觉模型 API 调用失败: {}", e);
            self.api_error(e)
        })?;

        debug!("视觉模型调用成功");

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| VisionError::EmptyContent {
                model: self.model_name.clone(),
            })?;

        Ok(content.trim().to_string())
    }

    fn api_error(&self, source: async_openai::error::OpenAIError) -> VisionError {
        VisionError::ApiCallFailed {
            model: self.model_name.clone(),
            source,
        }
    }
}

/// 将图片字节编码为 data URL
pub fn to_data_url(image: &[u8], mime: &str) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(image))
}

/// 基于视觉模型的识别器
///
/// 同一个服务可以配不同的提示词：验证码识别或整页信息提取
pub struct VisionRecognizer {
    service: Arc<VisionService>,
    prompt: &'static str,
    name: String,
}

impl VisionRecognizer {
    pub fn new(service: Arc<VisionService>, prompt: &'static str) -> Self {
        let name = format!("vision:{}", service.model_name());
        Self {
            service,
            prompt,
            name,
        }
    }

    /// 验证码识别
    pub fn captcha(service: Arc<VisionService>) -> Self {
        Self::new(service, CAPTCHA_PROMPT)
    }

    /// SUNARP 车辆截图信息提取
    pub fn vehicle_sheet(service: Arc<VisionService>) -> Self {
        Self::new(service, VEHICLE_PROMPT)
    }
}

#[async_trait]
impl Recognizer for VisionRecognizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognize(&self, image: &[u8]) -> AppResult<String> {
        self.service
            .send_image(self.prompt, image, sniff_mime(image))
            .await
    }
}

/// 根据文件头判断图片类型，无法判断时按 PNG 处理
pub fn sniff_mime(image: &[u8]) -> &'static str {
    match image {
        [0xff, 0xd8, 0xff, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [0x42, 0x4d, ..] => "image/bmp",
        _ => "image/png",
    }
}
