//! Instance segmentation datasets
//!
//! A dataset yields images with their class and instance label maps. Label
//! maps are stored as 8-bit grayscale PNGs; the value 255 marks pixels to
//! ignore and is read back as -1.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use log::debug;
use ndarray::Array2;

use crate::error::{FcisError, Result};
use crate::preprocess::load_image;
use crate::voc_classes;

/// Label value written to PNGs for ignored pixels
const PNG_IGNORE: u8 = 255;

/// One training or evaluation example
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: String,
    pub image: DynamicImage,
    /// Class label map, 0 = background, -1 = ignore
    pub lbl_cls: Array2<i32>,
    /// Instance label map, 0 = background, -1 = ignore
    pub lbl_ins: Array2<i32>,
}

pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Sample>;

    /// Class names, background first
    fn class_names(&self) -> &[&'static str];

    /// Label value of ignored pixels
    fn ignore_label(&self) -> i32 {
        -1
    }
}

/// Dataset laid out as
///
/// ```text
/// {root}/{split}.txt        one id per line
/// {root}/images/{id}.jpg
/// {root}/class/{id}.png
/// {root}/instance/{id}.png
/// ```
#[derive(Debug, Clone)]
pub struct LabelPngDataset {
    root: PathBuf,
    ids: Vec<String>,
    class_names: &'static [&'static str],
}

impl LabelPngDataset {
    /// Open the `split` of a PASCAL VOC style dataset.
    pub fn pascal(root: impl AsRef<Path>, split: &str) -> Result<Self> {
        Self::new(root, split, &voc_classes::NAMES)
    }

    pub fn new(
        root: impl AsRef<Path>,
        split: &str,
        class_names: &'static [&'static str],
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let split_file = root.join(format!("{split}.txt"));
        if !split_file.exists() {
            return Err(FcisError::Dataset(format!(
                "split file not found: {}",
                split_file.display()
            )));
        }
        let ids: Vec<String> = std::fs::read_to_string(&split_file)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        debug!("{}: {} ids", split_file.display(), ids.len());
        Ok(Self {
            root,
            ids,
            class_names,
        })
    }

    fn read_label(&self, dir: &str, id: &str) -> Result<Array2<i32>> {
        let path = self.root.join(dir).join(format!("{id}.png"));
        let img = image::open(&path)?.to_luma8();
        let (width, height) = img.dimensions();
        let data: Vec<i32> = img
            .into_raw()
            .into_iter()
            .map(|v| if v == PNG_IGNORE { -1 } else { v as i32 })
            .collect();
        Ok(Array2::from_shape_vec(
            (height as usize, width as usize),
            data,
        )?)
    }
}

impl Dataset for LabelPngDataset {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let id = self.ids.get(index).ok_or_else(|| {
            FcisError::Dataset(format!("index {index} out of range ({})", self.ids.len()))
        })?;
        let image = load_image(self.root.join("images").join(format!("{id}.jpg")))?;
        let lbl_cls = self.read_label("class", id)?;
        let lbl_ins = self.read_label("instance", id)?;

        let size = (image.height() as usize, image.width() as usize);
        if lbl_cls.dim() != size || lbl_ins.dim() != size {
            return Err(FcisError::Dataset(format!(
                "{id}: image is {size:?} but labels are {:?} and {:?}",
                lbl_cls.dim(),
                lbl_ins.dim()
            )));
        }
        let n_class = self.class_names.len() as i32;
        if let Some(&bad) = lbl_cls.iter().find(|&&c| c >= n_class) {
            return Err(FcisError::Dataset(format!(
                "{id}: class label {bad} out of range for {n_class} classes"
            )));
        }

        Ok(Sample {
            id: id.clone(),
            image,
            lbl_cls,
            lbl_ins,
        })
    }

    fn class_names(&self) -> &[&'static str] {
        self.class_names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn write_dataset(root: &Path) {
        for dir in ["images", "class", "instance"] {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }
        std::fs::write(root.join("train.txt"), "0001\n\n").unwrap();

        RgbImage::from_pixel(6, 4, Rgb([128, 64, 32]))
            .save(root.join("images/0001.jpg"))
            .unwrap();
        let mut cls = GrayImage::new(6, 4);
        let mut ins = GrayImage::new(6, 4);
        cls.put_pixel(1, 1, Luma([15]));
        ins.put_pixel(1, 1, Luma([1]));
        cls.put_pixel(5, 3, Luma([255]));
        ins.put_pixel(5, 3, Luma([255]));
        cls.save(root.join("class/0001.png")).unwrap();
        ins.save(root.join("instance/0001.png")).unwrap();
    }

    #[test]
    fn test_label_png_dataset() {
        let root = std::env::temp_dir().join(format!("fcis_dataset_{}", std::process::id()));
        write_dataset(&root);

        let dataset = LabelPngDataset::pascal(&root, "train").unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.class_names().len(), 21);

        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.id, "0001");
        assert_eq!(sample.lbl_cls.dim(), (4, 6));
        assert_eq!(sample.lbl_cls[[1, 1]], 15);
        assert_eq!(sample.lbl_ins[[1, 1]], 1);
        assert_eq!(sample.lbl_cls[[3, 5]], -1);
        assert_eq!(sample.lbl_ins[[3, 5]], -1);
        assert_eq!(sample.lbl_ins[[0, 0]], 0);

        assert!(matches!(dataset.get(1), Err(FcisError::Dataset(_))));
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_missing_split() {
        let err = LabelPngDataset::pascal("/nonexistent/fcis", "val").unwrap_err();
        assert!(matches!(err, FcisError::Dataset(_)));
    }
}
