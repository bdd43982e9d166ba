mod tests_global;
