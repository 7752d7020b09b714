use std::{collections::HashMap, fmt, sync::Arc};

use data_model::{MimeType, TransformationSpec};
use strum::IntoEnumIterator;

use super::{
    builtin::{BuiltinKind, BuiltinTransformation},
    Transformation,
    TransformationError,
    TransformationFactory,
    WorkingImage,
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown transformation: {0}")]
    UnknownTransformation(String),

    #[error("Transformation {0} is already registered")]
    Duplicate(String),

    #[error("Unable to produce images of type {0}")]
    Unproducible(MimeType),

    #[error(transparent)]
    Invalid(#[from] TransformationError),
}

#[derive(Clone)]
enum Factory {
    Builtin(BuiltinKind),
    Extension(Arc<dyn TransformationFactory>),
}

/// An instantiated transformation, ready to run against a working image.
pub enum Capability {
    Builtin(BuiltinTransformation),
    Extension(Box<dyn Transformation>),
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Builtin(builtin) => f.debug_tuple("Builtin").field(builtin).finish(),
            Capability::Extension(_) => f.write_str("Extension"),
        }
    }
}

impl Capability {
    pub fn apply(&self, image: &mut WorkingImage) -> Result<(), TransformationError> {
        match self {
            Capability::Builtin(builtin) => builtin.apply(image),
            Capability::Extension(extension) => extension.apply(image),
        }
    }
}

/// Maps transformation names to factories. Built once at startup and shared
/// read-only between requests.
#[derive(Clone)]
pub struct TransformationRegistry {
    factories: HashMap<String, Factory>,
    output_types: Vec<MimeType>,
}

impl Default for TransformationRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl TransformationRegistry {
    /// Every built-in transformation, able to produce every known type.
    pub fn with_builtins() -> Self {
        let factories = BuiltinKind::iter()
            .map(|kind| (kind.as_ref().to_string(), Factory::Builtin(kind)))
            .collect();
        Self {
            factories,
            output_types: MimeType::iter().collect(),
        }
    }

    /// Restricts the types content negotiation may convert to. The order is
    /// the tie-break order between equally acceptable types.
    pub fn with_output_types(mut self, output_types: Vec<MimeType>) -> Self {
        self.output_types = output_types;
        self
    }

    pub fn register(
        &mut self,
        name: &str,
        factory: Arc<dyn TransformationFactory>,
    ) -> Result<(), RegistryError> {
        if self.factories.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.factories
            .insert(name.to_string(), Factory::Extension(factory));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn output_types(&self) -> &[MimeType] {
        &self.output_types
    }

    pub fn can_produce(&self, mime_type: MimeType) -> bool {
        self.output_types.contains(&mime_type)
    }

    pub fn instantiate(&self, spec: &TransformationSpec) -> Result<Capability, RegistryError> {
        let factory = self
            .factories
            .get(&spec.name)
            .ok_or_else(|| RegistryError::UnknownTransformation(spec.name.clone()))?;
        let capability = match factory {
            Factory::Builtin(kind) => {
                let builtin = kind.instantiate(&spec.params)?;
                if let BuiltinTransformation::Convert { mime_type } = builtin {
                    if !self.can_produce(mime_type) {
                        return Err(RegistryError::Unproducible(mime_type));
                    }
                }
                Capability::Builtin(builtin)
            }
            Factory::Extension(factory) => Capability::Extension(factory.create(&spec.params)?),
        };
        Ok(capability)
    }
}
