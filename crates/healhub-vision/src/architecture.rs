//! Network architectures rebuilt from configuration data
//!
//! A model artifact on disk is only a set of named tensors. The network that
//! consumes them is described by an [`ArchitectureSpec`]: either declared by
//! the artifact itself (manifest entry or `<stem>.arch.yaml` sidecar) or
//! taken from a registered [`FamilyTemplate`] when the artifact carries
//! weights only.

use crate::preprocess::{InputSize, Normalization};
use candle_core::{DType, Device, Module, ModuleT, Tensor, D};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Func, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One layer of a sequential network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        #[serde(default = "default_stride")]
        stride: usize,
        #[serde(default)]
        padding: usize,
        #[serde(default = "default_true")]
        bias: bool,
    },

    BatchNorm {
        num_features: usize,
        #[serde(default = "default_eps")]
        eps: f64,
    },

    /// Dense layer; missing dimensions are read from the weight tensor
    Linear {
        #[serde(default)]
        in_features: Option<usize>,
        #[serde(default)]
        out_features: Option<usize>,
        #[serde(default = "default_true")]
        bias: bool,
    },

    Relu,
    Relu6,
    MaxPool {
        size: usize,
    },
    GlobalAvgPool,
    Flatten,

    /// No-op at inference time, kept so training-time layer indices line up
    Dropout {
        #[serde(default)]
        rate: f32,
    },

    /// Pretrained feature extractor producing a `[batch, features]` tensor
    Backbone {
        arch: BackboneArch,
    },

    Sigmoid,
    Softmax,
}

/// Feature extractors available as backbones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackboneArch {
    Resnet18,
    Resnet34,
}

/// A layer plus the tensor-name scope its weights live under.
///
/// Without a name the layer index is used, matching how sequential
/// containers name their children. An empty name means the root scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub layer: LayerSpec,
}

impl LayerDef {
    pub fn new(layer: LayerSpec) -> Self {
        Self { name: None, layer }
    }

    pub fn named(name: impl Into<String>, layer: LayerSpec) -> Self {
        Self {
            name: Some(name.into()),
            layer,
        }
    }
}

impl From<LayerSpec> for LayerDef {
    fn from(layer: LayerSpec) -> Self {
        Self::new(layer)
    }
}

/// Full description of a sequential network and the input it expects
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    pub layers: Vec<LayerDef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization: Option<Normalization>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_size: Option<InputSize>,
}

/// Named architecture template used to recover weights-only artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyTemplate {
    pub name: String,

    #[serde(flatten)]
    pub spec: ArchitectureSpec,
}

/// How the network's raw output should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputActivation {
    /// Unnormalized scores
    Logits,
    /// Network ends in a sigmoid
    Sigmoid,
    /// Network ends in a softmax
    Softmax,
}

impl ArchitectureSpec {
    pub fn new(layers: Vec<LayerDef>) -> Self {
        Self {
            layers,
            normalization: None,
            input_size: None,
        }
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = Some(normalization);
        self
    }

    pub fn with_input_size(mut self, size: InputSize) -> Self {
        self.input_size = Some(size);
        self
    }

    /// Parse from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Activation applied by the final layer
    pub fn output_activation(&self) -> OutputActivation {
        match self.layers.last().map(|l| &l.layer) {
            Some(LayerSpec::Sigmoid) => OutputActivation::Sigmoid,
            Some(LayerSpec::Softmax) => OutputActivation::Softmax,
            _ => OutputActivation::Logits,
        }
    }

    /// Rebuild the network over a set of named tensors.
    ///
    /// Fails when a tensor is missing or has the wrong shape, which is how
    /// an architecture mismatch shows up.
    pub fn build(&self, tensors: &HashMap<String, Tensor>, device: &Device) -> candle_core::Result<Network> {
        if self.layers.is_empty() {
            candle_core::bail!("architecture has no layers");
        }

        let vb = VarBuilder::from_tensors(tensors.clone(), DType::F32, device);
        let mut layers = Vec::with_capacity(self.layers.len());

        for (idx, def) in self.layers.iter().enumerate() {
            let name = def.name.clone().unwrap_or_else(|| idx.to_string());
            let scope = if name.is_empty() { vb.clone() } else { vb.pp(&name) };
            layers.push(build_layer(&def.layer, &name, scope, tensors)?);
        }

        Ok(Network {
            layers,
            output: self.output_activation(),
        })
    }
}

fn build_layer(
    spec: &LayerSpec,
    name: &str,
    vb: VarBuilder<'static>,
    tensors: &HashMap<String, Tensor>,
) -> candle_core::Result<Layer> {
    let layer = match spec {
        LayerSpec::Conv2d {
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            bias,
        } => {
            let cfg = Conv2dConfig {
                stride: *stride,
                padding: *padding,
                ..Default::default()
            };
            let conv = if *bias {
                candle_nn::conv2d(*in_channels, *out_channels, *kernel_size, cfg, vb)?
            } else {
                candle_nn::conv2d_no_bias(*in_channels, *out_channels, *kernel_size, cfg, vb)?
            };
            Layer::Conv(conv)
        }
        LayerSpec::BatchNorm { num_features, eps } => {
            Layer::BatchNorm(candle_nn::batch_norm(*num_features, *eps, vb)?)
        }
        LayerSpec::Linear {
            in_features,
            out_features,
            bias,
        } => {
            let (inferred_out, inferred_in) = linear_dims(tensors, name)?;
            let in_dim = in_features.unwrap_or(inferred_in);
            let out_dim = out_features.unwrap_or(inferred_out);
            let linear = if *bias {
                candle_nn::linear(in_dim, out_dim, vb)?
            } else {
                candle_nn::linear_no_bias(in_dim, out_dim, vb)?
            };
            Layer::Linear(linear)
        }
        LayerSpec::Relu => Layer::Relu,
        LayerSpec::Relu6 => Layer::Relu6,
        LayerSpec::MaxPool { size } => Layer::MaxPool(*size),
        LayerSpec::GlobalAvgPool => Layer::GlobalAvgPool,
        LayerSpec::Flatten => Layer::Flatten,
        LayerSpec::Dropout { .. } => Layer::Identity,
        LayerSpec::Backbone { arch } => {
            let func = match arch {
                BackboneArch::Resnet18 => candle_transformers::models::resnet::resnet18_no_final_layer(vb)?,
                BackboneArch::Resnet34 => candle_transformers::models::resnet::resnet34_no_final_layer(vb)?,
            };
            Layer::Backbone(func)
        }
        LayerSpec::Sigmoid => Layer::Sigmoid,
        LayerSpec::Softmax => Layer::Softmax,
    };

    Ok(layer)
}

/// `(out, in)` of a dense layer's weight matrix
fn linear_dims(tensors: &HashMap<String, Tensor>, name: &str) -> candle_core::Result<(usize, usize)> {
    let key = if name.is_empty() {
        "weight".to_string()
    } else {
        format!("{}.weight", name)
    };

    match tensors.get(&key) {
        Some(weight) => weight.dims2(),
        None => candle_core::bail!("cannot find tensor {}", key),
    }
}

enum Layer {
    Conv(Conv2d),
    BatchNorm(BatchNorm),
    Linear(Linear),
    Relu,
    Relu6,
    MaxPool(usize),
    GlobalAvgPool,
    Flatten,
    Identity,
    Backbone(Func<'static>),
    Sigmoid,
    Softmax,
}

impl Layer {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Conv(conv) => conv.forward(xs),
            Self::BatchNorm(bn) => bn.forward_t(xs, false),
            Self::Linear(linear) => linear.forward(xs),
            Self::Relu => xs.relu(),
            Self::Relu6 => xs.clamp(0f32, 6f32),
            Self::MaxPool(size) => xs.max_pool2d(*size),
            Self::GlobalAvgPool => xs.mean(D::Minus1)?.mean(D::Minus1),
            Self::Flatten => xs.flatten_from(1),
            Self::Identity => Ok(xs.clone()),
            Self::Backbone(func) => func.forward(xs),
            Self::Sigmoid => candle_nn::ops::sigmoid(xs),
            Self::Softmax => candle_nn::ops::softmax(xs, D::Minus1),
        }
    }
}

/// Sequential network rebuilt from an [`ArchitectureSpec`]
pub struct Network {
    layers: Vec<Layer>,
    output: OutputActivation,
}

impl Network {
    pub fn output_activation(&self) -> OutputActivation {
        self.output
    }
}

impl Module for Network {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("depth", &self.layers.len())
            .field("output", &self.output)
            .finish()
    }
}

/// Built-in recovery templates, tried in order
pub fn default_families() -> Vec<FamilyTemplate> {
    vec![
        // torchvision resnet18 state dict with a replaced `fc` head
        FamilyTemplate {
            name: "resnet18-classifier".to_string(),
            spec: ArchitectureSpec::new(vec![
                LayerDef::named("", LayerSpec::Backbone { arch: BackboneArch::Resnet18 }),
                LayerDef::named(
                    "fc",
                    LayerSpec::Linear {
                        in_features: Some(512),
                        out_features: None,
                        bias: true,
                    },
                ),
            ])
            .with_normalization(Normalization::ImageNet)
            .with_input_size(InputSize::square(224)),
        },
        // frozen feature extractor + dense(128, relu) + dense(1, sigmoid)
        FamilyTemplate {
            name: "resnet18-binary-head".to_string(),
            spec: ArchitectureSpec::new(vec![
                LayerDef::named("backbone", LayerSpec::Backbone { arch: BackboneArch::Resnet18 }),
                LayerDef::named(
                    "head.0",
                    LayerSpec::Linear {
                        in_features: Some(512),
                        out_features: Some(128),
                        bias: true,
                    },
                ),
                LayerDef::named("head.1", LayerSpec::Relu),
                LayerDef::named("head.2", LayerSpec::Dropout { rate: 0.3 }),
                LayerDef::named(
                    "head.3",
                    LayerSpec::Linear {
                        in_features: Some(128),
                        out_features: Some(1),
                        bias: true,
                    },
                ),
                LayerDef::named("head.4", LayerSpec::Sigmoid),
            ])
            .with_normalization(Normalization::Symmetric)
            .with_input_size(InputSize::square(180)),
        },
    ]
}

fn default_stride() -> usize {
    1
}

fn default_eps() -> f64 {
    1e-5
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_head(out: usize) -> HashMap<String, Tensor> {
        let mut tensors = HashMap::new();
        tensors.insert(
            "1.weight".to_string(),
            Tensor::zeros((out, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "1.bias".to_string(),
            Tensor::ones(out, DType::F32, &Device::Cpu).unwrap(),
        );
        tensors
    }

    #[test]
    fn test_parse_architecture_yaml() {
        let yaml = r#"
layers:
  - type: conv2d
    in_channels: 3
    out_channels: 8
    kernel_size: 3
    padding: 1
  - type: relu
  - type: global_avg_pool
  - name: classifier
    type: linear
    out_features: 4
  - type: softmax
normalization: unit_scale
input_size: 224
"#;

        let spec = ArchitectureSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.layers.len(), 5);
        assert_eq!(spec.layers[3].name.as_deref(), Some("classifier"));
        assert_eq!(spec.normalization, Some(Normalization::UnitScale));
        assert_eq!(spec.input_size, Some(InputSize::square(224)));
        assert_eq!(spec.output_activation(), OutputActivation::Softmax);

        match &spec.layers[0].layer {
            LayerSpec::Conv2d { stride, bias, .. } => {
                assert_eq!(*stride, 1);
                assert!(*bias);
            }
            other => panic!("expected conv2d, got {:?}", other),
        }
    }

    #[test]
    fn test_build_infers_linear_dims() {
        let spec = ArchitectureSpec::new(vec![
            LayerSpec::GlobalAvgPool.into(),
            LayerSpec::Linear {
                in_features: None,
                out_features: None,
                bias: true,
            }
            .into(),
        ]);

        let network = spec.build(&dense_head(4), &Device::Cpu).unwrap();
        assert_eq!(network.output_activation(), OutputActivation::Logits);

        let input = Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let out = network.forward(&input).unwrap();
        assert_eq!(out.dims(), &[1, 4]);
    }

    #[test]
    fn test_build_rejects_shape_mismatch() {
        let spec = ArchitectureSpec::new(vec![
            LayerSpec::GlobalAvgPool.into(),
            LayerSpec::Linear {
                in_features: Some(5),
                out_features: Some(4),
                bias: true,
            }
            .into(),
        ]);

        assert!(spec.build(&dense_head(4), &Device::Cpu).is_err());
    }

    #[test]
    fn test_build_rejects_missing_tensor() {
        let spec = ArchitectureSpec::new(vec![LayerDef::named(
            "fc",
            LayerSpec::Linear {
                in_features: None,
                out_features: None,
                bias: true,
            },
        )]);

        assert!(spec.build(&dense_head(2), &Device::Cpu).is_err());
    }

    #[test]
    fn test_default_families() {
        let families = default_families();
        assert_eq!(families.len(), 2);
        assert_eq!(families[0].spec.normalization, Some(Normalization::ImageNet));
        assert_eq!(
            families[1].spec.output_activation(),
            OutputActivation::Sigmoid
        );
    }

    /// Randomly initialised tensors named the way the family's training code saves them
    fn resnet_state_dict(prefix: &str, head: impl Fn(VarBuilder) -> candle_core::Result<()>) -> HashMap<String, Tensor> {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let backbone = if prefix.is_empty() { vb.clone() } else { vb.pp(prefix) };
        candle_transformers::models::resnet::resnet18_no_final_layer(backbone).unwrap();
        head(vb).unwrap();

        let data = varmap.data().lock().unwrap();
        let tensors = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        tensors
    }

    fn family(name: &str) -> FamilyTemplate {
        default_families()
            .into_iter()
            .find(|f| f.name == name)
            .unwrap()
    }

    #[test]
    fn test_resnet18_classifier_loads_torchvision_names() {
        let tensors = resnet_state_dict("", |vb| candle_nn::linear(512, 5, vb.pp("fc")).map(|_| ()));
        assert!(tensors.contains_key("conv1.weight"));
        assert!(tensors.contains_key("layer1.0.conv1.weight"));
        assert!(tensors.contains_key("bn1.running_mean"));

        let network = family("resnet18-classifier").spec.build(&tensors, &Device::Cpu).unwrap();
        let input = Tensor::zeros((1, 3, 64, 64), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(network.forward(&input).unwrap().dims(), &[1, 5]);
        assert_eq!(network.output_activation(), OutputActivation::Logits);
    }

    #[test]
    fn test_resnet18_binary_head_loads_backbone_and_head() {
        let tensors = resnet_state_dict("backbone", |vb| {
            candle_nn::linear(512, 128, vb.pp("head.0"))?;
            candle_nn::linear(128, 1, vb.pp("head.3"))?;
            Ok(())
        });
        assert!(tensors.contains_key("backbone.layer4.1.bn2.weight"));

        let network = family("resnet18-binary-head").spec.build(&tensors, &Device::Cpu).unwrap();
        let input = Tensor::zeros((1, 3, 64, 64), DType::F32, &Device::Cpu).unwrap();
        let out = network.forward(&input).unwrap();
        assert_eq!(out.dims(), &[1, 1]);

        let p = out.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((0.0..=1.0).contains(&p));

        // The classifier layout is not a binary head
        assert!(family("resnet18-classifier").spec.build(&tensors, &Device::Cpu).is_err());
    }

    #[test]
    fn test_family_yaml_flattened() {
        let yaml = r#"
name: tiny-head
layers:
  - type: global_avg_pool
  - name: head
    type: linear
normalization: symmetric
"#;
        let family: FamilyTemplate = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(family.name, "tiny-head");
        assert_eq!(family.spec.layers.len(), 2);
        assert_eq!(family.spec.normalization, Some(Normalization::Symmetric));
    }
}
