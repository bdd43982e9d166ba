mod tests_dataset;
mod tests_vlen;
