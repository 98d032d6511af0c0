/// Pretrained unconditional DDPM checkpoints this crate knows out of the box.
/// Any other diffusers-layout repo id can still be passed straight to
/// `DdpmPipeline::from_pretrained`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// 32x32 samples in the style of CIFAR-10.
    Cifar10,
    /// 256x256 celebrity faces.
    CelebaHq,
    /// 256x256 church photographs (LSUN).
    Church,
    /// 256x256 bedrooms (LSUN).
    Bedroom,
}

impl ModelKind {
    pub fn repo(&self) -> &'static str {
        match self {
            ModelKind::Cifar10 => "google/ddpm-cifar10-32",
            ModelKind::CelebaHq => "google/ddpm-celebahq-256",
            ModelKind::Church => "google/ddpm-church-256",
            ModelKind::Bedroom => "google/ddpm-bedroom-256",
        }
    }

    /// Edge length of the generated square images.
    pub fn sample_size(&self) -> usize {
        match self {
            ModelKind::Cifar10 => 32,
            _ => 256,
        }
    }

    pub fn from_repo(repo: &str) -> Option<Self> {
        match repo {
            "google/ddpm-cifar10-32" => Some(ModelKind::Cifar10),
            "google/ddpm-celebahq-256" => Some(ModelKind::CelebaHq),
            "google/ddpm-church-256" => Some(ModelKind::Church),
            "google/ddpm-bedroom-256" => Some(ModelKind::Bedroom),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_ids_round_trip() {
        for kind in [
            ModelKind::Cifar10,
            ModelKind::CelebaHq,
            ModelKind::Church,
            ModelKind::Bedroom,
        ] {
            assert_eq!(ModelKind::from_repo(kind.repo()), Some(kind));
        }
        assert_eq!(ModelKind::from_repo("nonexistent/repo"), None);
    }
}
