//! VDI creation.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sheepdog_core::socket_transport::SocketConnector;
use sheepdog_core::transport::Connector;
use sheepdog_proto::constants::{
    MAX_DATA_OBJS, SD_DEFAULT_BLOCK_SIZE_SHIFT, SD_EC_MAX_STRIP, SD_MAX_BLOCK_SIZE_SHIFT,
    SD_MAX_COPIES, SD_MIN_BLOCK_SIZE_SHIFT,
};
use tracing::{debug, info, warn};

use crate::admin::{AdminClient, NewVdiParams};
use crate::config::DriverConfig;
use crate::device::SheepdogDevice;
use crate::error::{DriverError, DriverResult};
use crate::location::VdiLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prealloc {
    #[default]
    Off,
    /// Allocate every object at creation.
    Full,
}

impl FromStr for Prealloc {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Prealloc::Off),
            "full" => Ok(Prealloc::Full),
            other => Err(DriverError::InvalidArgument(format!(
                "invalid preallocation mode '{}'",
                other
            ))),
        }
    }
}

/// Options for creating a VDI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateOptions {
    pub size: u64,
    /// `"x"` for x replicas, `"x:y"` for x data and y parity strips.
    pub redundancy: Option<String>,
    /// Object size in bytes; the cluster default when unset.
    pub object_size: Option<u64>,
    /// Snapshot the new VDI is cloned from.
    pub backing: Option<String>,
    pub prealloc: Prealloc,
}

/// Copy count and copy policy of a redundancy scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redundancy {
    pub copies: u8,
    pub copy_policy: u8,
}

fn invalid(msg: impl Into<String>) -> DriverError {
    DriverError::InvalidArgument(msg.into())
}

/// Parse `"x"` (replicated) or `"x:y"` (erasure coded).
pub fn parse_redundancy(s: &str) -> DriverResult<Redundancy> {
    let parts: Vec<&str> = s.split(':').collect();
    let num = |p: &str| {
        p.parse::<u32>()
            .map_err(|_| invalid(format!("invalid redundancy '{}'", s)))
    };

    match parts.as_slice() {
        [copies] => {
            let copies = num(copies)?;
            if copies == 0 || copies > SD_MAX_COPIES as u32 {
                return Err(invalid(format!(
                    "copies must be between 1 and {}",
                    SD_MAX_COPIES
                )));
            }
            Ok(Redundancy {
                copies: copies as u8,
                copy_policy: 0,
            })
        }
        [data, parity] => {
            let data = num(data)?;
            let parity = num(parity)?;
            if !matches!(data, 2 | 4 | 8 | 16) {
                return Err(invalid("data strips must be one of 2, 4, 8, 16"));
            }
            if parity == 0 || parity >= SD_EC_MAX_STRIP as u32 {
                return Err(invalid(format!(
                    "parity strips must be between 1 and {}",
                    SD_EC_MAX_STRIP - 1
                )));
            }
            Ok(Redundancy {
                copies: (data + parity) as u8,
                copy_policy: (((data / 2) << 4) + parity) as u8,
            })
        }
        _ => Err(invalid(format!("invalid redundancy '{}'", s))),
    }
}

/// Block size shift of an object size.
pub fn parse_object_size(object_size: u64) -> DriverResult<u8> {
    if !object_size.is_power_of_two() {
        return Err(invalid("object size must be a power of 2"));
    }
    let shift = object_size.trailing_zeros() as u8;
    if !(SD_MIN_BLOCK_SIZE_SHIFT..=SD_MAX_BLOCK_SIZE_SHIFT).contains(&shift) {
        return Err(invalid(format!(
            "object size must be between {} and {} bytes",
            1u64 << SD_MIN_BLOCK_SIZE_SHIFT,
            1u64 << SD_MAX_BLOCK_SIZE_SHIFT
        )));
    }
    Ok(shift)
}

impl SheepdogDevice {
    /// Create the VDI at `location`, returning its id.
    pub async fn create(
        location: &str,
        opts: &CreateOptions,
        config: &DriverConfig,
    ) -> DriverResult<u32> {
        let location = VdiLocation::parse(location)?;
        let connector: Arc<dyn Connector> = Arc::new(SocketConnector::new(location.host.clone()));
        Self::create_with_connector(connector, &location, opts, config).await
    }

    pub async fn create_with_connector(
        connector: Arc<dyn Connector>,
        location: &VdiLocation,
        opts: &CreateOptions,
        config: &DriverConfig,
    ) -> DriverResult<u32> {
        if location.is_snapshot() {
            return Err(invalid("cannot create a snapshot location"));
        }
        let admin = AdminClient::new(Arc::clone(&connector));

        let mut params = NewVdiParams {
            name: location.vdi.clone(),
            vdi_size: opts.size,
            ..Default::default()
        };
        if let Some(redundancy) = &opts.redundancy {
            let r = parse_redundancy(redundancy)?;
            params.nr_copies = r.copies;
            params.copy_policy = r.copy_policy;
        }
        params.block_size_shift = match opts.object_size {
            Some(size) => parse_object_size(size)?,
            None => match admin.cluster_defaults().await {
                Ok(d) if d.block_size_shift != 0 => d.block_size_shift,
                Ok(_) => SD_DEFAULT_BLOCK_SIZE_SHIFT,
                Err(e) => {
                    warn!("cannot get cluster defaults, using 4 MB objects: {}", e);
                    SD_DEFAULT_BLOCK_SIZE_SHIFT
                }
            },
        };

        let max_size = (1u64 << params.block_size_shift) * MAX_DATA_OBJS;
        if opts.size > max_size {
            return Err(invalid(format!(
                "{} bytes is too big, the maximum is {}",
                opts.size, max_size
            )));
        }

        if let Some(backing) = &opts.backing {
            let base = VdiLocation::parse(backing)?;
            if !base.is_snapshot() {
                return Err(invalid("cannot clone from a non-snapshot VDI"));
            }
            params.base_vdi_id = admin.find_vdi(&base.vdi, base.snap_id, &base.tag, None).await?;
            debug!("cloning {} from {:#x}", location.vdi, params.base_vdi_id);
        }

        let vid = admin.new_vdi(&params).await?;
        info!("created {} as {:#x}, {} bytes", location.vdi, vid, opts.size);

        if opts.prealloc == Prealloc::Full {
            prealloc(connector, location, config).await?;
        }
        Ok(vid)
    }
}

/// Allocate every object by reading and writing it back.
async fn prealloc(
    connector: Arc<dyn Connector>,
    location: &VdiLocation,
    config: &DriverConfig,
) -> DriverResult<()> {
    let dev = SheepdogDevice::open_with_connector(connector, location.clone(), config.clone()).await?;
    let size = dev.length();
    let obj_size = dev.inode().object_size();

    let mut res = Ok(());
    let mut start = 0u64;
    while start < size {
        let len = obj_size.min(size - start) as usize;
        let step = match dev.read(start, len).await {
            Ok(buf) => dev.write(start, &buf).await,
            Err(e) => Err(e),
        };
        if let Err(e) = step {
            res = Err(e);
            break;
        }
        start += len as u64;
    }
    dev.close().await?;
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use sheepdog_proto::SdError;

    fn loc(s: &str) -> VdiLocation {
        VdiLocation::parse(s).unwrap()
    }

    #[test]
    fn test_replicated_redundancy() {
        assert_eq!(
            parse_redundancy("3").unwrap(),
            Redundancy {
                copies: 3,
                copy_policy: 0
            }
        );
        assert!(parse_redundancy("0").is_err());
        assert!(parse_redundancy("32").is_err());
        assert!(parse_redundancy("abc").is_err());
    }

    #[test]
    fn test_erasure_coded_redundancy() {
        let r = parse_redundancy("4:2").unwrap();
        assert_eq!(r.copies, 6);
        assert_eq!(r.copy_policy, (2 << 4) + 2);

        let r = parse_redundancy("16:15").unwrap();
        assert_eq!(r.copies, 31);
        assert_eq!(r.copy_policy, (8 << 4) + 15);

        assert!(parse_redundancy("3:1").is_err());
        assert!(parse_redundancy("4:0").is_err());
        assert!(parse_redundancy("4:16").is_err());
        assert!(parse_redundancy("4:2:1").is_err());
    }

    #[test]
    fn test_object_size() {
        assert_eq!(parse_object_size(1 << 22).unwrap(), 22);
        assert_eq!(parse_object_size(1 << 20).unwrap(), 20);
        assert_eq!(parse_object_size(1 << 31).unwrap(), 31);
        assert!(parse_object_size(1 << 19).is_err());
        assert!(parse_object_size(1 << 32).is_err());
        assert!(parse_object_size(3 << 20).is_err());
        assert!(parse_object_size(0).is_err());
    }

    #[test]
    fn test_prealloc_mode() {
        assert_eq!("full".parse::<Prealloc>().unwrap(), Prealloc::Full);
        assert_eq!("off".parse::<Prealloc>().unwrap(), Prealloc::Off);
        assert!("sparse".parse::<Prealloc>().is_err());
    }

    #[tokio::test]
    async fn test_create_with_redundancy_and_object_size() {
        let cluster = FakeCluster::new();
        let opts = CreateOptions {
            size: 1 << 30,
            redundancy: Some("4:2".into()),
            object_size: Some(1 << 20),
            ..Default::default()
        };
        let config = DriverConfig::default();
        let vid = SheepdogDevice::create_with_connector(cluster.connector(), &loc("vol1"), &opts, &config)
            .await
            .unwrap();

        let inode = cluster.inode(vid);
        assert_eq!(inode.name, "vol1");
        assert_eq!(inode.vdi_size, 1 << 30);
        assert_eq!(inode.nr_copies, 6);
        assert_eq!(inode.copy_policy, 0x22);
        assert_eq!(inode.block_size_shift, 20);

        let again = SheepdogDevice::create_with_connector(cluster.connector(), &loc("vol1"), &opts, &config).await;
        assert!(matches!(
            again,
            Err(DriverError::Server {
                source: SdError::VdiExist,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_create_uses_cluster_default_object_size() {
        let cluster = FakeCluster::new();
        let opts = CreateOptions {
            size: 1 << 30,
            ..Default::default()
        };
        let vid = SheepdogDevice::create_with_connector(
            cluster.connector(),
            &loc("vol1"),
            &opts,
            &DriverConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(cluster.inode(vid).block_size_shift, SD_DEFAULT_BLOCK_SIZE_SHIFT);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_requests() {
        let cluster = FakeCluster::new();
        let config = DriverConfig::default();

        let too_big = CreateOptions {
            size: (1 << 20) * MAX_DATA_OBJS + 1,
            object_size: Some(1 << 20),
            ..Default::default()
        };
        assert!(matches!(
            SheepdogDevice::create_with_connector(cluster.connector(), &loc("vol1"), &too_big, &config).await,
            Err(DriverError::InvalidArgument(_))
        ));

        let opts = CreateOptions {
            size: 1 << 30,
            ..Default::default()
        };
        assert!(matches!(
            SheepdogDevice::create_with_connector(cluster.connector(), &loc("vol1:snap"), &opts, &config).await,
            Err(DriverError::InvalidArgument(_))
        ));

        cluster.add_vdi("base", 1 << 30);
        let not_snapshot = CreateOptions {
            size: 1 << 30,
            backing: Some("base".into()),
            ..Default::default()
        };
        assert!(matches!(
            SheepdogDevice::create_with_connector(cluster.connector(), &loc("clone"), &not_snapshot, &config).await,
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_create_from_backing_snapshot() {
        let cluster = FakeCluster::new();
        let config = DriverConfig::default();
        cluster.add_vdi("base", 1 << 30);

        let dev = SheepdogDevice::open_with_connector(cluster.connector(), loc("base"), config.clone())
            .await
            .unwrap();
        dev.write(4096, b"golden").await.unwrap();
        let snap_vid = dev.vdi_id();
        dev.snapshot_create("gold", 0, 0).await.unwrap();
        dev.close().await.unwrap();

        let opts = CreateOptions {
            size: 1 << 30,
            backing: Some("base:gold".into()),
            ..Default::default()
        };
        let vid = SheepdogDevice::create_with_connector(cluster.connector(), &loc("clone"), &opts, &config)
            .await
            .unwrap();
        assert_eq!(cluster.inode(vid).parent_vdi_id, snap_vid);

        let clone = SheepdogDevice::open_with_connector(cluster.connector(), loc("clone"), config)
            .await
            .unwrap();
        assert_eq!(clone.read(4096, 6).await.unwrap(), b"golden");
    }

    #[tokio::test]
    async fn test_create_preallocated() {
        let cluster = FakeCluster::new();
        let opts = CreateOptions {
            size: 3 << 20,
            object_size: Some(1 << 20),
            prealloc: Prealloc::Full,
            ..Default::default()
        };
        let vid = SheepdogDevice::create_with_connector(
            cluster.connector(),
            &loc("vol1"),
            &opts,
            &DriverConfig::default(),
        )
        .await
        .unwrap();

        let inode = cluster.inode(vid);
        assert!((0..3).all(|idx| inode.get_vid(idx) == vid));
        assert_eq!(inode.get_vid(3), 0);
        assert!(!cluster.is_locked(vid));
    }
}
