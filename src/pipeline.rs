use std::sync::Arc;

use bytes::Bytes;
use data_model::{Image, MimeType, TransformationSpec};
use metrics::Timer;
use tracing::debug;

use crate::{
    content_negotiation::AcceptHeader,
    events::{PipelineEvent, PipelineObserver},
    transformations::{
        BuiltinTransformation,
        Capability,
        RegistryError,
        TransformationError,
        TransformationRegistry,
        WorkingImage,
        DEFAULT_MAX_DIMENSION,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unknown transformation: {0}")]
    UnknownTransformation(String),

    #[error("Not acceptable: {0}")]
    NotAcceptable(String),

    #[error(transparent)]
    Transformation(#[from] TransformationError),
}

impl From<RegistryError> for PipelineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownTransformation(name) => Self::UnknownTransformation(name),
            RegistryError::Unproducible(mime_type) => {
                Self::NotAcceptable(format!("unable to produce {mime_type}"))
            }
            RegistryError::Invalid(err) => Self::Transformation(err),
            RegistryError::Duplicate(name) => Self::Transformation(TransformationError::failed(
                &name,
                "registered more than once",
            )),
        }
    }
}

/// The representation a pipeline run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub bytes: Bytes,
    pub mime_type: MimeType,
    pub width: u32,
    pub height: u32,
}

/// Where the output type comes from when the caller did not convert
/// explicitly.
#[derive(Debug, Clone)]
pub enum OutputFormat {
    /// An extension on the request path, e.g. `/images/abc.jpg`.
    Extension(MimeType),
    /// The request's `Accept` header.
    Negotiate(AcceptHeader),
}

pub struct TransformationPipeline {
    registry: Arc<TransformationRegistry>,
    observers: Vec<Arc<dyn PipelineObserver>>,
    metrics: Arc<metrics::pipeline::Metrics>,
    max_dimension: u32,
}

impl TransformationPipeline {
    pub fn new(
        registry: Arc<TransformationRegistry>,
        metrics: Arc<metrics::pipeline::Metrics>,
    ) -> Self {
        Self {
            registry,
            observers: Vec::new(),
            metrics,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }

    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn registry(&self) -> &TransformationRegistry {
        &self.registry
    }

    fn notify(&self, event: PipelineEvent) {
        for observer in &self.observers {
            observer.notify(&event);
        }
    }

    /// Applies `transformations` to `source` in the given order, then makes
    /// sure the result is of a type the client accepts.
    ///
    /// Every transformation is instantiated before the first one runs, so an
    /// unknown name or bad parameter fails the run without doing any work.
    /// The same source and transformations always produce the same bytes.
    pub fn run(
        &self,
        source: Bytes,
        image: &Image,
        transformations: &[TransformationSpec],
        output: &OutputFormat,
    ) -> Result<PipelineOutput, PipelineError> {
        let _timer = Timer::start_with_labels(&self.metrics.runs, &[]);

        let capabilities = transformations
            .iter()
            .map(|spec| {
                self.registry
                    .instantiate(spec)
                    .map(|capability| (spec.name.as_str(), capability))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.notify(PipelineEvent::TransformationsStarted {
            owner: image.owner.clone(),
            identifier: image.identifier.clone(),
            transformations: transformations.iter().map(ToString::to_string).collect(),
        });

        let mut working = WorkingImage::new(source, image.mime_type, image.width, image.height)
            .with_max_dimension(self.max_dimension);
        for (name, capability) in &capabilities {
            self.apply(name, capability, &mut working)?;
        }

        if let Some(target) = self.target_type(working.mime_type(), output)? {
            if let OutputFormat::Negotiate(_) = output {
                self.notify(PipelineEvent::ConversionAppended {
                    from: working.mime_type(),
                    to: target,
                });
            }
            let convert = self
                .registry
                .instantiate(&TransformationSpec::convert_to(target))?;
            self.apply("convert", &convert, &mut working)?;
        }

        let modified = working.is_modified();
        let (mime_type, width, height) = (working.mime_type(), working.width(), working.height());
        let bytes = working.encode()?;

        self.notify(PipelineEvent::TransformationsFinished {
            mime_type,
            width,
            height,
            modified,
        });
        Ok(PipelineOutput {
            bytes,
            mime_type,
            width,
            height,
        })
    }

    /// The type [`TransformationPipeline::run`] would produce, without
    /// decoding anything. Transformations are validated the same way, so
    /// every error `run` reports before touching pixels is reported here too.
    pub fn output_type(
        &self,
        image: &Image,
        transformations: &[TransformationSpec],
        output: &OutputFormat,
    ) -> Result<MimeType, PipelineError> {
        let mut current = image.mime_type;
        for spec in transformations {
            if let Capability::Builtin(BuiltinTransformation::Convert { mime_type }) =
                self.registry.instantiate(spec)?
            {
                current = mime_type;
            }
        }
        Ok(self.target_type(current, output)?.unwrap_or(current))
    }

    fn apply(
        &self,
        name: &str,
        capability: &Capability,
        working: &mut WorkingImage,
    ) -> Result<(), PipelineError> {
        capability.apply(working)?;
        self.notify(PipelineEvent::TransformationApplied {
            name: name.to_string(),
            width: working.width(),
            height: working.height(),
        });
        Ok(())
    }

    /// The type to convert to after the explicit transformations, if any.
    fn target_type(
        &self,
        current: MimeType,
        output: &OutputFormat,
    ) -> Result<Option<MimeType>, PipelineError> {
        match output {
            OutputFormat::Extension(requested) => {
                if !self.registry.can_produce(*requested) {
                    return Err(PipelineError::NotAcceptable(format!(
                        "unable to produce {requested}"
                    )));
                }
                Ok((*requested != current).then_some(*requested))
            }
            OutputFormat::Negotiate(accept) => {
                if accept.is_acceptable(current) {
                    return Ok(None);
                }
                let best = accept
                    .best_match(self.registry.output_types())
                    .ok_or_else(|| {
                        PipelineError::NotAcceptable(format!(
                            "none of the producible types is acceptable for {current}"
                        ))
                    })?;
                debug!(from = %current, to = %best, "negotiated output type");
                Ok(Some(best))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_image, TEST_IDENTIFIER, TEST_OWNER};
    use image::ImageFormat;

    use super::*;
    use crate::events::tests::RecordingObserver;

    fn pipeline(registry: TransformationRegistry) -> (TransformationPipeline, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let pipeline = TransformationPipeline::new(
            Arc::new(registry),
            Arc::new(metrics::pipeline::Metrics::new()),
        )
        .with_observer(observer.clone());
        (pipeline, observer)
    }

    fn source(width: u32, height: u32) -> (Image, Bytes) {
        let mut image = mock_image(TEST_OWNER, TEST_IDENTIFIER, width, height);
        let blob = image.take_blob().unwrap();
        (image, blob)
    }

    fn spec(raw: &str) -> TransformationSpec {
        raw.parse().unwrap()
    }

    fn any() -> OutputFormat {
        OutputFormat::Negotiate(AcceptHeader::any())
    }

    #[test]
    fn test_no_transformations_returns_source() {
        let (pipeline, observer) = pipeline(TransformationRegistry::with_builtins());
        let (image, blob) = source(100, 50);
        let output = pipeline.run(blob.clone(), &image, &[], &any()).unwrap();
        assert_eq!(blob, output.bytes);
        assert_eq!(MimeType::Png, output.mime_type);
        assert_eq!((100, 50), (output.width, output.height));
        assert_eq!(
            Some(&PipelineEvent::TransformationsFinished {
                mime_type: MimeType::Png,
                width: 100,
                height: 50,
                modified: false,
            }),
            observer.events().last()
        );
    }

    #[test]
    fn test_order_is_preserved() {
        let (pipeline, _) = pipeline(TransformationRegistry::with_builtins());
        let (image, blob) = source(100, 50);
        let crop = spec("crop:x=0,y=0,width=50,height=50");
        let border = spec("border:width=5,height=5");

        let crop_first = pipeline
            .run(blob.clone(), &image, &[crop.clone(), border.clone()], &any())
            .unwrap();
        let border_first = pipeline.run(blob, &image, &[border, crop], &any()).unwrap();

        assert_eq!((60, 60), (crop_first.width, crop_first.height));
        assert_eq!((50, 50), (border_first.width, border_first.height));
        let decoded = image::load_from_memory(&crop_first.bytes).unwrap();
        assert_eq!((60, 60), (decoded.width(), decoded.height()));
    }

    #[test]
    fn test_output_type_matches_run() {
        let registry = TransformationRegistry::with_builtins()
            .with_output_types(vec![MimeType::Png, MimeType::Jpeg, MimeType::Webp]);
        let (pipeline, observer) = pipeline(registry);
        let (image, blob) = source(20, 10);
        let webp = OutputFormat::Negotiate(AcceptHeader::parse(Some("image/webp")));
        let gif = OutputFormat::Negotiate(AcceptHeader::parse(Some("image/gif")));

        let cases: Vec<(Vec<TransformationSpec>, OutputFormat)> = vec![
            (vec![], any()),
            (vec![spec("convert:type=jpg")], any()),
            (vec![spec("convert:type=jpg"), spec("resize:width=5")], webp.clone()),
            (vec![], OutputFormat::Extension(MimeType::Jpeg)),
        ];
        for (transformations, output) in cases {
            let planned = pipeline.output_type(&image, &transformations, &output).unwrap();
            let produced = pipeline
                .run(blob.clone(), &image, &transformations, &output)
                .unwrap();
            assert_eq!(produced.mime_type, planned);
        }

        let events = observer.events().len();
        assert!(matches!(
            pipeline.output_type(&image, &[], &gif),
            Err(PipelineError::NotAcceptable(_))
        ));
        assert!(matches!(
            pipeline.output_type(&image, &[spec("sepia")], &any()),
            Err(PipelineError::UnknownTransformation(_))
        ));
        assert_eq!(events, observer.events().len());
    }

    #[test]
    fn test_configured_maximum_dimension() {
        let (pipeline, _) = pipeline(TransformationRegistry::with_builtins());
        let pipeline = pipeline.with_max_dimension(200);
        let (image, blob) = source(100, 50);

        let output = pipeline
            .run(blob.clone(), &image, &[spec("resize:width=200")], &any())
            .unwrap();
        assert_eq!((200, 100), (output.width, output.height));

        for raw in [
            "resize:width=201",
            "border:width=2147483648,height=1",
            "canvas:width=300,height=10",
            "thumbnail:width=50,height=4000",
        ] {
            assert!(
                matches!(
                    pipeline.run(blob.clone(), &image, &[spec(raw)], &any()),
                    Err(PipelineError::Transformation(TransformationError::Failed { .. }))
                ),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_later_transformations_see_earlier_geometry() {
        let (pipeline, observer) = pipeline(TransformationRegistry::with_builtins());
        let (image, blob) = source(100, 50);
        let output = pipeline
            .run(
                blob,
                &image,
                &[spec("rotate:angle=90"), spec("resize:width=25")],
                &any(),
            )
            .unwrap();
        assert_eq!((25, 50), (output.width, output.height));

        let applied: Vec<_> = observer
            .events()
            .into_iter()
            .filter_map(|event| match event {
                PipelineEvent::TransformationApplied { name, width, height } => {
                    Some((name, width, height))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            vec![("rotate".to_string(), 50, 100), ("resize".to_string(), 25, 50)],
            applied
        );
    }

    #[test]
    fn test_unknown_transformation_aborts_before_any_work() {
        let (pipeline, observer) = pipeline(TransformationRegistry::with_builtins());
        let (image, blob) = source(10, 10);
        let err = pipeline
            .run(blob, &image, &[spec("resize:width=5"), spec("sepia")], &any())
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownTransformation(name) if name == "sepia"));
        assert!(observer.events().is_empty());
    }

    #[test]
    fn test_transformation_faults() {
        let (pipeline, _) = pipeline(TransformationRegistry::with_builtins());
        let (image, blob) = source(10, 10);
        let err = pipeline
            .run(blob.clone(), &image, &[spec("crop:x=5,width=10,height=10")], &any())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transformation(TransformationError::Failed { .. })));

        let err = pipeline
            .run(blob, &image, &[spec("resize:width=-3")], &any())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Transformation(TransformationError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_negotiation_appends_conversion() {
        let (pipeline, observer) = pipeline(TransformationRegistry::with_builtins());
        let (image, blob) = source(20, 10);
        let accept = OutputFormat::Negotiate(AcceptHeader::parse(Some("image/webp")));
        let output = pipeline.run(blob, &image, &[], &accept).unwrap();

        assert_eq!(MimeType::Webp, output.mime_type);
        assert_eq!(ImageFormat::WebP, image::guess_format(&output.bytes).unwrap());
        assert!(observer.events().contains(&PipelineEvent::ConversionAppended {
            from: MimeType::Png,
            to: MimeType::Webp,
        }));
    }

    #[test]
    fn test_acceptable_type_is_kept() {
        let (pipeline, observer) = pipeline(TransformationRegistry::with_builtins());
        let (image, blob) = source(20, 10);
        let accept = OutputFormat::Negotiate(AcceptHeader::parse(Some("image/*;q=0.5, image/webp")));
        let output = pipeline.run(blob.clone(), &image, &[], &accept).unwrap();
        assert_eq!(MimeType::Png, output.mime_type);
        assert_eq!(blob, output.bytes);
        assert!(!observer
            .events()
            .iter()
            .any(|event| matches!(event, PipelineEvent::ConversionAppended { .. })));
    }

    #[test]
    fn test_not_acceptable() {
        let registry = TransformationRegistry::with_builtins()
            .with_output_types(vec![MimeType::Png, MimeType::Jpeg, MimeType::Webp]);
        let (pipeline, _) = pipeline(registry);
        let (image, blob) = source(20, 10);

        let accept = OutputFormat::Negotiate(AcceptHeader::parse(Some("image/gif")));
        assert!(matches!(
            pipeline.run(blob.clone(), &image, &[], &accept),
            Err(PipelineError::NotAcceptable(_))
        ));
        assert!(matches!(
            pipeline.run(blob, &image, &[], &OutputFormat::Extension(MimeType::Gif)),
            Err(PipelineError::NotAcceptable(_))
        ));
    }

    #[test]
    fn test_extension_overrides_accept() {
        let (pipeline, _) = pipeline(TransformationRegistry::with_builtins());
        let (image, blob) = source(20, 10);
        let output = pipeline
            .run(blob, &image, &[], &OutputFormat::Extension(MimeType::Jpeg))
            .unwrap();
        assert_eq!(MimeType::Jpeg, output.mime_type);
        assert_eq!(ImageFormat::Jpeg, image::guess_format(&output.bytes).unwrap());
    }

    #[test]
    fn test_output_is_deterministic() {
        let (pipeline, _) = pipeline(TransformationRegistry::with_builtins());
        let (image, blob) = source(64, 48);
        let chain = [
            spec("thumbnail:width=20,height=20"),
            spec("border:color=ff0000"),
            spec("convert:type=jpg"),
            spec("compress:quality=60"),
        ];
        let first = pipeline.run(blob.clone(), &image, &chain, &any()).unwrap();
        let second = pipeline.run(blob, &image, &chain, &any()).unwrap();
        assert_eq!(first, second);
        assert_eq!(MimeType::Jpeg, first.mime_type);
    }
}
