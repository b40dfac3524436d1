//! Format tags understood by the bundled stages.

/// Extended XYZ structure file.
pub const EXTXYZ: &str = "extxyz";

/// Single LAMMPS text dump file.
pub const LAMMPS_DUMP_TEXT: &str = "lammps/dump-text";

/// Exploration task directory (`traj/` dumps plus deviation files).
pub const LAMMPS_OUTPUT_DIR: &str = "lammps/output-dir";

/// Labeling task directory.
pub const CP2K_OUTPUT_DIR: &str = "cp2k/output-dir";

/// Training dataset directory.
pub const DEEPMD_NPY: &str = "deepmd/npy";

/// Frozen model file.
pub const DEEPMD_MODEL: &str = "deepmd/model";
