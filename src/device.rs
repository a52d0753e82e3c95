use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::math::lens::{ChromaticCoefficients, LensProfile, RadialCoefficients};
use crate::HmdConfig;

/// Capabilities reported by a connected head-mounted display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HmdDescriptor {
    pub product_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub panel_resolution: [u32; 2],
}

/// Structured device query. Enumeration itself lives outside this crate;
/// implementations adapt whatever the host platform offers.
pub trait HmdProbe: Send + Sync {
    fn probe(&self) -> Result<Vec<HmdDescriptor>>;
}

/// A fixed device list.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    devices: Vec<HmdDescriptor>,
}

impl StaticProbe {
    pub fn new(devices: Vec<HmdDescriptor>) -> Self {
        Self { devices }
    }

    /// No HMD attached.
    pub fn none() -> Self {
        Self::default()
    }
}

impl HmdProbe for StaticProbe {
    fn probe(&self) -> Result<Vec<HmdDescriptor>> {
        Ok(self.devices.clone())
    }
}

struct BuiltinProfile {
    name: &'static str,
    /// USB vendor / product id pairs
    ids: &'static [(u16, u16)],
    /// Lowercase product name fragment for the opt-in name match
    product_name: Option<&'static str>,
    build: fn() -> LensProfile,
}

const OCULUS_VR: u16 = 0x2833;

const BUILTINS: &[BuiltinProfile] = &[
    BuiltinProfile {
        name: "rift-dk1",
        ids: &[(OCULUS_VR, 0x0001)],
        product_name: Some("rift dk1"),
        build: rift_dk1,
    },
    BuiltinProfile {
        name: "rift-dk2",
        ids: &[(OCULUS_VR, 0x0021)],
        product_name: Some("rift dk2"),
        build: rift_dk2,
    },
    BuiltinProfile {
        name: "cardboard",
        ids: &[],
        product_name: Some("cardboard"),
        build: cardboard,
    },
    BuiltinProfile {
        name: "identity",
        ids: &[],
        product_name: None,
        build: identity,
    },
];

fn rift_dk1() -> LensProfile {
    LensProfile {
        name: "rift-dk1".into(),
        panel_resolution: [1280, 800],
        render_resolution: [640, 800],
        screen_size_m: [0.14976, 0.0936],
        lens_separation_m: 0.0635,
        fov_y_deg: 110.0,
        distortion: ChromaticCoefficients {
            red: RadialCoefficients([0.996, 0.22 * 0.996, 0.24 * 0.996, 0.0]),
            green: RadialCoefficients([1.0, 0.22, 0.24, 0.0]),
            blue: RadialCoefficients([1.014, 0.22 * 1.014, 0.24 * 1.014, 0.0]),
        },
    }
}

fn rift_dk2() -> LensProfile {
    LensProfile {
        name: "rift-dk2".into(),
        panel_resolution: [1920, 1080],
        render_resolution: [1182, 1464],
        screen_size_m: [0.12576, 0.07074],
        lens_separation_m: 0.0635,
        fov_y_deg: 100.0,
        distortion: ChromaticCoefficients {
            red: RadialCoefficients([0.994, 0.22 * 0.994, 0.24 * 0.994, 0.0]),
            green: RadialCoefficients([1.0, 0.22, 0.24, 0.0]),
            blue: RadialCoefficients([1.012, 0.22 * 1.012, 0.24 * 1.012, 0.0]),
        },
    }
}

fn cardboard() -> LensProfile {
    LensProfile {
        name: "cardboard".into(),
        panel_resolution: [1920, 1080],
        render_resolution: [960, 1080],
        screen_size_m: [0.11, 0.062],
        lens_separation_m: 0.055,
        fov_y_deg: 90.0,
        distortion: ChromaticCoefficients::uniform(RadialCoefficients([1.0, 0.441, 0.156, 0.0])),
    }
}

fn identity() -> LensProfile {
    LensProfile::identity(1920, 1080)
}

/// Built-in lens profile by name.
pub fn builtin_profile(name: &str) -> Option<LensProfile> {
    BUILTINS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .map(|p| (p.build)())
}

pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTINS.iter().map(|p| p.name)
}

/// Picks the session's lens profile.
///
/// An inline custom profile wins, then a named built-in, then a device whose
/// vendor/product id is known. Matching on the product name is a fallback
/// the configuration has to opt into.
pub fn resolve_lens_profile(probe: &dyn HmdProbe, config: &HmdConfig) -> Result<LensProfile> {
    if let Some(custom) = &config.custom {
        custom.validate()?;
        info!(profile = %custom.name, "using custom lens profile");
        return Ok(custom.clone());
    }

    if let Some(name) = &config.profile {
        let profile = builtin_profile(name).ok_or_else(|| {
            PipelineError::Config(format!(
                "unknown lens profile {name}; known: {}",
                builtin_names().collect::<Vec<_>>().join(", ")
            ))
        })?;
        info!(profile = %profile.name, "lens profile set by configuration");
        return Ok(profile);
    }

    let devices = probe.probe()?;
    debug!(count = devices.len(), "probed HMDs");

    for device in &devices {
        let id = (device.vendor_id, device.product_id);
        if let Some(builtin) = BUILTINS.iter().find(|p| p.ids.contains(&id)) {
            info!(
                device = %device.product_name,
                profile = builtin.name,
                "matched HMD by vendor/product id"
            );
            return Ok((builtin.build)());
        }
    }

    if config.match_product_name {
        for device in &devices {
            let product = device.product_name.to_ascii_lowercase();
            let found = BUILTINS.iter().find(|p| {
                p.product_name
                    .is_some_and(|fragment| product.contains(fragment))
            });
            if let Some(builtin) = found {
                info!(
                    device = %device.product_name,
                    profile = builtin.name,
                    "matched HMD by product name"
                );
                return Ok((builtin.build)());
            }
        }
    }

    Err(PipelineError::DeviceNotFound(match devices.len() {
        0 => "no HMD connected".to_string(),
        n => format!("{n} HMD(s) connected but none has a known lens profile"),
    }))
}
