//! チェックポイント（バイナリのパラメータコンテナ）
//!
//! 形式（リトルエンディアン）:
//! - マジック `SIAMQSAR` + バージョン (u32)
//! - メタデータ: 長さ (u32) + JSON（ネットワーク構造・スケーラ・実行設定）
//! - テンソル数 (u32)、各テンソルは 名前長 (u32) + 名前 + 次元数 (u32) + 各次元 (u64) + f32 データ

use crate::config::RunConfig;
use crate::error::{Result, SiamError};
use crate::nn::{NetworkShape, SiameseNetwork, Tensor};
use crate::scaler::StandardScaler;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const MAGIC: &[u8; 8] = b"SIAMQSAR";
pub const FORMAT_VERSION: u32 = 1;

/// 名前・メタデータの上限（壊れたファイルで巨大な確保をしないため）
const MAX_NAME_LEN: u32 = 4096;
const MAX_META_LEN: u32 = 64 << 20;

/// チェックポイントのメタデータ
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub shape: NetworkShape,
    pub target_scaler: Option<StandardScaler>,
    pub feature_scaler: Option<StandardScaler>,
    pub config: RunConfig,
    pub created_at: String,
    /// 学習中に保存したエポック
    #[serde(default)]
    pub epoch: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub meta: CheckpointMeta,
    pub tensors: BTreeMap<String, Tensor>,
}

impl Checkpoint {
    pub fn from_network(
        network: &SiameseNetwork,
        config: &RunConfig,
        target_scaler: Option<&StandardScaler>,
        feature_scaler: Option<&StandardScaler>,
    ) -> Self {
        Self {
            meta: CheckpointMeta {
                shape: network.shape.clone(),
                target_scaler: target_scaler.cloned(),
                feature_scaler: feature_scaler.cloned(),
                config: config.clone(),
                created_at: chrono::Local::now().to_rfc3339(),
                epoch: None,
            },
            tensors: network.state_dict(),
        }
    }

    /// 保存されている構造でネットワークを再構築し、パラメータを厳密に読み込む
    pub fn build_network(&self) -> Result<SiameseNetwork> {
        let mut network = SiameseNetwork::new(self.meta.shape.clone());
        network.load_state_dict(&self.tensors, true)?;
        Ok(network)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SiamError::at_path(parent, e))?;
        }
        let file = File::create(path).map_err(|e| SiamError::at_path(path, e))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush().map_err(|e| SiamError::at_path(path, e))?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| SiamError::at_path(path, e))?;
        Self::read_from(&mut BufReader::new(file))
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(FORMAT_VERSION)?;

        let meta = serde_json::to_vec(&self.meta)?;
        w.write_u32::<LittleEndian>(meta.len() as u32)?;
        w.write_all(&meta)?;

        w.write_u32::<LittleEndian>(self.tensors.len() as u32)?;
        for (name, tensor) in &self.tensors {
            w.write_u32::<LittleEndian>(name.len() as u32)?;
            w.write_all(name.as_bytes())?;
            w.write_u32::<LittleEndian>(tensor.shape.len() as u32)?;
            for &d in &tensor.shape {
                w.write_u64::<LittleEndian>(d as u64)?;
            }
            for &v in &tensor.data {
                w.write_f32::<LittleEndian>(v)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(SiamError::Checkpoint("not a siamqsar checkpoint (bad magic)".into()));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(SiamError::Checkpoint(format!("unsupported checkpoint version {version}")));
        }

        let meta_len = r.read_u32::<LittleEndian>()?;
        if meta_len > MAX_META_LEN {
            return Err(SiamError::Checkpoint(format!("metadata too large ({meta_len} bytes)")));
        }
        let mut meta_buf = vec![0u8; meta_len as usize];
        r.read_exact(&mut meta_buf)?;
        let meta: CheckpointMeta = serde_json::from_slice(&meta_buf)?;

        let count = r.read_u32::<LittleEndian>()?;
        let mut tensors = BTreeMap::new();
        for _ in 0..count {
            let name_len = r.read_u32::<LittleEndian>()?;
            if name_len > MAX_NAME_LEN {
                return Err(SiamError::Checkpoint(format!("tensor name too long ({name_len})")));
            }
            let mut name_buf = vec![0u8; name_len as usize];
            r.read_exact(&mut name_buf)?;
            let name = String::from_utf8(name_buf)
                .map_err(|_| SiamError::Checkpoint("tensor name is not UTF-8".into()))?;

            let ndim = r.read_u32::<LittleEndian>()?;
            let mut shape = Vec::with_capacity(ndim as usize);
            for _ in 0..ndim {
                shape.push(r.read_u64::<LittleEndian>()? as usize);
            }
            let numel: usize = shape.iter().product();
            let mut data = vec![0.0f32; numel];
            r.read_f32_into::<LittleEndian>(&mut data)?;
            tensors.insert(name, Tensor { shape, data });
        }
        Ok(Self { meta, tensors })
    }
}

/// 事前学習済みエンコーダを読み込む（`encoder.*` のみ、非厳密）
pub fn load_pretrained_encoder<P: AsRef<Path>>(network: &mut SiameseNetwork, path: P) -> Result<()> {
    let ckpt = Checkpoint::load(path)?;
    network.load_pretrained_encoder(&ckpt.tensors)?;
    Ok(())
}
