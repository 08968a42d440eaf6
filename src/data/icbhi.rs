use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use burn::data::dataset::Dataset;
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::augment::SpecAugment;
use crate::config::{ClassSplit, ExperimentConfig, PadType, TestFold};
use crate::data::LungSoundItem;
use crate::io::{read_wav, resample, AudioError};
use crate::pad::pad_or_trim;
use crate::spectrogram::{FbankExtractor, Spectrogram};

pub const OFFICIAL_SPLIT_FILE: &str = "official_split.txt";
pub const FOLD_FILE: &str = "patient_list_foldwise.txt";
pub const DIAGNOSIS_FILE: &str = "patient_diagnosis.txt";

pub const DEVICES: [&str; 4] = ["Meditron", "LittC2SE", "Litt3200", "AKGC417L"];

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Audio { path: PathBuf, source: AudioError },
    #[error("{path}:{line}: malformed line")]
    MalformedLine { path: PathBuf, line: usize },
    #[error("malformed recording name `{0}`")]
    MalformedRecording(String),
    #[error("unknown stethoscope device `{0}`")]
    UnknownDevice(String),
    #[error("unknown diagnosis `{0}`")]
    UnknownDiagnosis(String),
    #[error("recording `{0}` is missing from the split file")]
    MissingSplit(String),
    #[error("patient {0} is missing from the metadata")]
    MissingPatient(u32),
    #[error("no respiratory cycles found for the {0} split")]
    Empty(&'static str),
}

fn read_file(path: &Path) -> Result<String, DatasetError> {
    fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses whitespace separated `key value` lines.
fn read_pairs(path: &Path) -> Result<Vec<(String, String)>, DatasetError> {
    read_file(path)?
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            line.split_whitespace()
                .collect_tuple::<(_, _)>()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| DatasetError::MalformedLine {
                    path: path.to_path_buf(),
                    line: idx + 1,
                })
        })
        .collect()
}

fn parse_patient(path: &Path, line: usize, raw: &str) -> Result<u32, DatasetError> {
    raw.parse().map_err(|_| DatasetError::MalformedLine {
        path: path.to_path_buf(),
        line,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub name: String,
    pub patient: u32,
    pub device: usize,
}

impl Recording {
    /// `{patient}_{index}_{location}_{mode}_{device}`
    pub fn parse(name: &str) -> Result<Self, DatasetError> {
        let parts = name.split('_').collect_vec();
        if parts.len() != 5 {
            return Err(DatasetError::MalformedRecording(name.to_string()));
        }

        let patient = parts[0]
            .parse()
            .map_err(|_| DatasetError::MalformedRecording(name.to_string()))?;
        let device = DEVICES
            .iter()
            .position(|d| *d == parts[4])
            .ok_or_else(|| DatasetError::UnknownDevice(parts[4].to_string()))?;

        Ok(Self {
            name: name.to_string(),
            patient,
            device,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleAnnotation {
    pub start: f32,
    pub end: f32,
    pub crackle: bool,
    pub wheeze: bool,
}

pub fn read_annotations(path: &Path) -> Result<Vec<CycleAnnotation>, DatasetError> {
    read_file(path)?
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            let malformed = || DatasetError::MalformedLine {
                path: path.to_path_buf(),
                line: idx + 1,
            };
            let (start, end, crackle, wheeze) =
                line.split_whitespace().collect_tuple().ok_or_else(malformed)?;

            Ok(CycleAnnotation {
                start: start.parse().map_err(|_| malformed())?,
                end: end.parse().map_err(|_| malformed())?,
                crackle: crackle.parse::<u8>().map_err(|_| malformed())? == 1,
                wheeze: wheeze.parse::<u8>().map_err(|_| malformed())? == 1,
            })
        })
        .collect()
}

pub fn lungsound_label(annotation: &CycleAnnotation, n_cls: usize) -> usize {
    match (annotation.crackle, annotation.wheeze, n_cls) {
        (false, false, _) => 0,
        (_, _, 2) => 1,
        (true, false, _) => 1,
        (false, true, _) => 2,
        (true, true, _) => 3,
    }
}

pub fn diagnosis_label(diagnosis: &str, n_cls: usize) -> Result<usize, DatasetError> {
    let label = match diagnosis {
        "Healthy" => 0,
        "COPD" | "Bronchiectasis" | "Asthma" => 1,
        "URTI" | "LRTI" | "Pneumonia" | "Bronchiolitis" => 2,
        other => return Err(DatasetError::UnknownDiagnosis(other.to_string())),
    };

    Ok(if n_cls == 2 { label.min(1) } else { label })
}

#[derive(Debug, Clone)]
pub struct IcbhiOptions {
    pub data_folder: PathBuf,
    pub class_split: ClassSplit,
    pub n_cls: usize,
    pub test_fold: TestFold,
    pub stetho_id: i32,
    pub sample_rate: u32,
    pub cycle_len: usize,
    pub pad_type: PadType,
    pub nfft: usize,
    pub n_mels: usize,
}

impl From<&ExperimentConfig> for IcbhiOptions {
    fn from(config: &ExperimentConfig) -> Self {
        let args = &config.args;
        Self {
            data_folder: args.data_folder.clone(),
            class_split: args.class_split,
            n_cls: args.n_cls,
            test_fold: args.test_fold,
            stetho_id: args.stetho_id,
            sample_rate: args.sample_rate,
            cycle_len: config.cycle_len(),
            pad_type: args.pad_types,
            nfft: args.nfft,
            n_mels: args.n_mels,
        }
    }
}

#[derive(Debug, Clone)]
struct Cycle {
    spectrogram: Spectrogram,
    label: usize,
    audio: Vec<f32>,
}

pub struct IcbhiDataset {
    cycles: Vec<Cycle>,
    augment: Option<SpecAugment>,
    rng: Mutex<StdRng>,
    pub class_nums: Vec<usize>,
    pub class_ratio: Vec<f64>,
}

impl IcbhiDataset {
    pub fn load(
        options: &IcbhiOptions,
        train: bool,
        augment: Option<SpecAugment>,
        seed: u64,
    ) -> Result<Self, DatasetError> {
        let split_name = if train { "train" } else { "test" };
        let folder = &options.data_folder;

        let recordings = list_recordings(folder)?;
        let in_split = split_membership(folder, options.test_fold)?;
        let diagnoses = match options.class_split {
            ClassSplit::Diagnosis => Some(patient_diagnoses(folder)?),
            ClassSplit::Lungsound => None,
        };

        let mut selected = Vec::new();
        for recording in recordings {
            let is_train = match &in_split {
                Membership::Recordings(map) => *map
                    .get(&recording.name)
                    .ok_or_else(|| DatasetError::MissingSplit(recording.name.clone()))?,
                Membership::Patients { folds, test_fold } => {
                    let fold = folds
                        .get(&recording.patient)
                        .ok_or(DatasetError::MissingPatient(recording.patient))?;
                    fold != test_fold
                }
            };

            let device_matches =
                options.stetho_id < 0 || recording.device == options.stetho_id as usize;

            if is_train == train && device_matches {
                selected.push(recording);
            }
        }

        let extractor = FbankExtractor::new(options.sample_rate, options.nfft, options.n_mels);

        let cycles = selected
            .par_iter()
            .map(|recording| {
                let recording_label = match &diagnoses {
                    Some(diagnoses) => {
                        let diagnosis = diagnoses
                            .get(&recording.patient)
                            .ok_or(DatasetError::MissingPatient(recording.patient))?;
                        Some(diagnosis_label(diagnosis, options.n_cls)?)
                    }
                    None => None,
                };

                load_recording(folder, recording, recording_label, options, &extractor)
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect_vec();

        if cycles.is_empty() {
            return Err(DatasetError::Empty(split_name));
        }

        let mut class_nums = vec![0; options.n_cls];
        for cycle in &cycles {
            class_nums[cycle.label] += 1;
        }
        let class_ratio = class_nums
            .iter()
            .map(|n| *n as f64 / cycles.len() as f64)
            .collect_vec();

        info!(
            split = split_name,
            recordings = selected.len(),
            cycles = cycles.len(),
            ?class_nums,
            "loaded ICBHI"
        );

        Ok(Self {
            cycles,
            augment,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            class_nums,
            class_ratio,
        })
    }

    pub fn labels(&self) -> Vec<usize> {
        self.cycles.iter().map(|cycle| cycle.label).collect()
    }
}

impl Dataset<LungSoundItem> for IcbhiDataset {
    fn get(&self, index: usize) -> Option<LungSoundItem> {
        let cycle = self.cycles.get(index)?;

        let spectrogram = match &self.augment {
            Some(augment) => {
                let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                augment.apply(cycle.spectrogram.clone(), &mut *rng)
            }
            None => cycle.spectrogram.clone(),
        };

        Some(LungSoundItem {
            spectrogram: spectrogram.values,
            frames: spectrogram.frames,
            n_mels: spectrogram.n_mels,
            label: cycle.label,
            audio: cycle.audio.clone(),
        })
    }

    fn len(&self) -> usize {
        self.cycles.len()
    }
}

fn list_recordings(folder: &Path) -> Result<Vec<Recording>, DatasetError> {
    let entries = fs::read_dir(folder).map_err(|source| DatasetError::Io {
        path: folder.to_path_buf(),
        source,
    })?;

    entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "wav"))
        .filter_map(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .sorted()
        .map(|name| Recording::parse(&name))
        .collect()
}

enum Membership {
    /// recording name -> is train
    Recordings(HashMap<String, bool>),
    Patients {
        folds: HashMap<u32, u8>,
        test_fold: u8,
    },
}

fn split_membership(folder: &Path, test_fold: TestFold) -> Result<Membership, DatasetError> {
    match test_fold {
        TestFold::Official => {
            let path = folder.join(OFFICIAL_SPLIT_FILE);
            let map = read_pairs(&path)?
                .into_iter()
                .map(|(name, split)| (name, split == "train"))
                .collect();
            Ok(Membership::Recordings(map))
        }
        TestFold::Fold(k) => {
            let path = folder.join(FOLD_FILE);
            let folds = read_pairs(&path)?
                .into_iter()
                .enumerate()
                .map(|(idx, (patient, fold))| {
                    let patient = parse_patient(&path, idx + 1, &patient)?;
                    let fold = fold.parse::<u8>().map_err(|_| DatasetError::MalformedLine {
                        path: path.clone(),
                        line: idx + 1,
                    })?;
                    Ok((patient, fold))
                })
                .collect::<Result<_, DatasetError>>()?;
            Ok(Membership::Patients {
                folds,
                test_fold: k,
            })
        }
    }
}

fn patient_diagnoses(folder: &Path) -> Result<HashMap<u32, String>, DatasetError> {
    let path = folder.join(DIAGNOSIS_FILE);
    read_pairs(&path)?
        .into_iter()
        .enumerate()
        .map(|(idx, (patient, diagnosis))| Ok((parse_patient(&path, idx + 1, &patient)?, diagnosis)))
        .collect()
}

fn load_recording(
    folder: &Path,
    recording: &Recording,
    recording_label: Option<usize>,
    options: &IcbhiOptions,
    extractor: &FbankExtractor,
) -> Result<Vec<Cycle>, DatasetError> {
    let wav_path = folder.join(format!("{}.wav", recording.name));
    let audio_err = |source| DatasetError::Audio {
        path: wav_path.clone(),
        source,
    };

    let (samples, sr) = read_wav(&wav_path).map_err(audio_err)?;
    let samples = resample(samples, sr, options.sample_rate).map_err(audio_err)?;
    let annotations = read_annotations(&folder.join(format!("{}.txt", recording.name)))?;

    let sr = options.sample_rate as f32;
    let cycles = annotations
        .iter()
        .filter_map(|annotation| {
            let start = ((annotation.start * sr) as usize).min(samples.len());
            let end = ((annotation.end * sr) as usize).min(samples.len());
            if start >= end {
                return None;
            }

            let audio = pad_or_trim(samples[start..end].to_vec(), options.cycle_len, options.pad_type);
            let label = recording_label.unwrap_or_else(|| lungsound_label(annotation, options.n_cls));

            Some(Cycle {
                spectrogram: extractor.extract(&audio),
                label,
                audio,
            })
        })
        .collect_vec();

    debug!(recording = %recording.name, cycles = cycles.len(), "processed recording");

    Ok(cycles)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs;
    use std::path::Path;

    use itertools::Itertools;

    use super::{DIAGNOSIS_FILE, FOLD_FILE, OFFICIAL_SPLIT_FILE};

    pub const SR: u32 = 16_000;

    pub fn write_recording(folder: &Path, name: &str, seconds: f32, cycles: &str) {
        let samples = (0..(seconds * SR as f32) as usize)
            .map(|i| ((i as f32 * 0.05).sin() * 8_000.0) as i16)
            .collect_vec();
        wavers::write(folder.join(format!("{name}.wav")), &samples[..], SR as i32, 1).unwrap();
        fs::write(folder.join(format!("{name}.txt")), cycles).unwrap();
    }

    /// Three recordings at 16 kHz:
    ///
    /// | recording | split | fold | diagnosis | cycle labels |
    /// |---|---|---|---|---|
    /// | 101 Meditron | train | 0 | COPD | 0, 1 |
    /// | 102 AKGC417L | train | 1 | Healthy | 2, 3 |
    /// | 103 LittC2SE | test | 2 | URTI | 0 (a second cycle lies past the audio) |
    pub fn synthetic_folder() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path();

        write_recording(folder, "101_1b1_Al_sc_Meditron", 3.0, "0.0 1.0 0 0\n1.0 2.5 1 0\n");
        write_recording(folder, "102_1b1_Ar_sc_AKGC417L", 2.0, "0.0 0.5 0 1\n0.5 2.0 1 1\n");
        write_recording(folder, "103_2b2_Pl_mc_LittC2SE", 1.0, "0.0 1.0 0 0\n4.0 5.0 1 0\n");

        fs::write(
            folder.join(OFFICIAL_SPLIT_FILE),
            "101_1b1_Al_sc_Meditron\ttrain\n102_1b1_Ar_sc_AKGC417L\ttrain\n103_2b2_Pl_mc_LittC2SE\ttest\n",
        )
        .unwrap();
        fs::write(folder.join(FOLD_FILE), "101\t0\n102\t1\n103\t2\n").unwrap();
        fs::write(folder.join(DIAGNOSIS_FILE), "101\tCOPD\n102\tHealthy\n103\tURTI\n").unwrap();

        dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use super::fixtures::{synthetic_folder, write_recording, SR};

    fn options(folder: &Path) -> IcbhiOptions {
        IcbhiOptions {
            data_folder: folder.to_path_buf(),
            class_split: ClassSplit::Lungsound,
            n_cls: 4,
            test_fold: TestFold::Official,
            stetho_id: -1,
            sample_rate: SR,
            cycle_len: SR as usize,
            pad_type: PadType::Repeat,
            nfft: 400,
            n_mels: 16,
        }
    }

    #[test]
    fn loads_cycles_of_the_requested_split() {
        let dir = synthetic_folder();
        let options = options(dir.path());

        let train = IcbhiDataset::load(&options, true, None, 0).unwrap();
        assert_eq!(train.len(), 4);
        assert_eq!(train.labels(), vec![0, 1, 2, 3]);
        assert_eq!(train.class_nums, vec![1, 1, 1, 1]);
        assert_eq!(train.class_ratio, vec![0.25; 4]);

        let item = train.get(1).unwrap();
        let frames = FbankExtractor::new(SR, 400, 16).num_frames(SR as usize);
        assert_eq!(item.audio.len(), SR as usize);
        assert_eq!(item.frames, frames);
        assert_eq!(item.n_mels, 16);
        assert_eq!(item.spectrogram.len(), frames * 16);
        assert!(train.get(4).is_none());

        let test = IcbhiDataset::load(&options, false, None, 0).unwrap();
        assert_eq!(test.labels(), vec![0]);
    }

    #[test]
    fn filters_by_stethoscope() {
        let dir = synthetic_folder();
        let options = IcbhiOptions {
            stetho_id: 3,
            ..options(dir.path())
        };

        let train = IcbhiDataset::load(&options, true, None, 0).unwrap();
        assert_eq!(train.labels(), vec![2, 3]);

        // the only LittC2SE recording is a test recording
        let options = IcbhiOptions {
            stetho_id: 1,
            ..options
        };
        assert!(matches!(
            IcbhiDataset::load(&options, true, None, 0),
            Err(DatasetError::Empty("train"))
        ));
    }

    #[test]
    fn recordings_missing_from_the_split_file_fail() {
        let dir = synthetic_folder();
        write_recording(dir.path(), "104_1b1_Al_sc_Litt3200", 1.0, "0.0 1.0 0 0\n");

        assert!(matches!(
            IcbhiDataset::load(&options(dir.path()), true, None, 0),
            Err(DatasetError::MissingSplit(name)) if name == "104_1b1_Al_sc_Litt3200"
        ));
    }

    #[test]
    fn splits_by_patient_fold() {
        let dir = synthetic_folder();
        let options = IcbhiOptions {
            test_fold: TestFold::Fold(1),
            ..options(dir.path())
        };

        let train = IcbhiDataset::load(&options, true, None, 0).unwrap();
        assert_eq!(train.labels(), vec![0, 1, 0]);
        assert_eq!(train.class_nums, vec![2, 1, 0, 0]);

        let test = IcbhiDataset::load(&options, false, None, 0).unwrap();
        assert_eq!(test.labels(), vec![2, 3]);

        write_recording(dir.path(), "104_1b1_Al_sc_Litt3200", 1.0, "0.0 1.0 0 0\n");
        assert!(matches!(
            IcbhiDataset::load(&options, true, None, 0),
            Err(DatasetError::MissingPatient(104))
        ));
    }

    #[test]
    fn labels_cycles_by_diagnosis() {
        let dir = synthetic_folder();
        let options = IcbhiOptions {
            class_split: ClassSplit::Diagnosis,
            n_cls: 3,
            ..options(dir.path())
        };

        let train = IcbhiDataset::load(&options, true, None, 0).unwrap();
        assert_eq!(train.labels(), vec![1, 1, 0, 0]);
        assert_eq!(train.class_nums, vec![2, 2, 0]);

        let test = IcbhiDataset::load(&options, false, None, 0).unwrap();
        assert_eq!(test.labels(), vec![2]);

        let two_class = IcbhiOptions { n_cls: 2, ..options };
        let test = IcbhiDataset::load(&two_class, false, None, 0).unwrap();
        assert_eq!(test.labels(), vec![1]);
    }

    #[test]
    fn parses_recording_names() {
        let recording = Recording::parse("101_1b1_Al_sc_Meditron").unwrap();
        assert_eq!(recording.patient, 101);
        assert_eq!(recording.device, 0);

        let recording = Recording::parse("226_1b1_Pl_sc_LittC2SE").unwrap();
        assert_eq!(recording.device, 1);

        assert!(matches!(
            Recording::parse("101_1b1_Al_sc_Phone"),
            Err(DatasetError::UnknownDevice(_))
        ));
        assert!(Recording::parse("101_Al").is_err());
    }

    #[test]
    fn maps_adventitious_sounds() {
        let cycle = |crackle, wheeze| CycleAnnotation {
            start: 0.0,
            end: 1.0,
            crackle,
            wheeze,
        };

        assert_eq!(lungsound_label(&cycle(false, false), 4), 0);
        assert_eq!(lungsound_label(&cycle(true, false), 4), 1);
        assert_eq!(lungsound_label(&cycle(false, true), 4), 2);
        assert_eq!(lungsound_label(&cycle(true, true), 4), 3);
        assert_eq!(lungsound_label(&cycle(false, true), 2), 1);
        assert_eq!(lungsound_label(&cycle(false, false), 2), 0);
    }

    #[test]
    fn maps_diagnoses() {
        assert_eq!(diagnosis_label("Healthy", 3).unwrap(), 0);
        assert_eq!(diagnosis_label("COPD", 3).unwrap(), 1);
        assert_eq!(diagnosis_label("URTI", 3).unwrap(), 2);
        assert_eq!(diagnosis_label("URTI", 2).unwrap(), 1);
        assert!(diagnosis_label("Flu", 3).is_err());
    }
}
